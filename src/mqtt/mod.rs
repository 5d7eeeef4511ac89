//! # MQTT Publisher
//!
//! The concrete broker session behind [`crate::session::SessionClient`]:
//! a small MQTT 3.1.1 codec, a transport trait with a TCP implementation on
//! `embassy-net`, and the session task that ties them together.

pub mod packet;
pub mod session;
pub mod transport;

pub use packet::QoS;
pub use session::{MqttSession, OutboundPublish};
pub use transport::{MqttTransport, TcpTransport, TcpTransportError, TransportError};
