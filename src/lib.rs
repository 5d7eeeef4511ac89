//! # Soil Moisture Telemetry Node
//!
//! `myrtio-soil` is a `no_std`, asynchronous firmware core that samples a
//! capacitive soil-moisture sensor over I2C and publishes every reading to
//! an MQTT broker over WiFi. It is built on the [Embassy](https://embassy.dev/)
//! async ecosystem.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Buffers are fixed-size and managed with `heapless`.
//! - **Hardware at the edges:** The bus, the radio and the settings partition
//!   are reached through small traits ([`bus::BusFactory`],
//!   [`link::WifiStation`], [`settings::SettingsStore`]), so the logic runs
//!   and is tested on the host.
//! - **Bounded link retry:** The station gives up after
//!   [`config::MAX_LINK_RETRIES`] reconnects and says so with a
//!   distinguishable [`link::LinkOutcome`].
//! - **Built-in MQTT 3.1.1 publisher:** [`mqtt::MqttSession`] connects over
//!   `embassy-net` TCP, reconnects on its own and reports lifecycle events.
//!
//! ## Architecture
//!
//! Two execution contexts share two pieces of state:
//!
//! - the network side ([`link::LinkSupervisor::supervise`],
//!   [`mqtt::MqttSession::run`]) posts events;
//! - the control task ([`monitor::SoilMonitor::run`]) samples once a second
//!   and publishes only while [`session::SessionState`] says the broker is up.
//!
//! ```ignore
//! static LINK: SharedLinkSupervisor = SharedLinkSupervisor::new();
//! static STATE: SessionState = SessionState::new();
//! static MQTT: MqttSession<CriticalSectionRawMutex, 4> = MqttSession::new();
//!
//! let mut sensor = Stemma::new(bus_factory, Delay);
//! let mut session = SessionClient::new(&STATE, &MQTT);
//! boot(&mut nvs, &mut sensor, &LINK, &mut station, &credentials, &mut session).await?;
//!
//! spawner.spawn(link_task(&LINK, station))?; // LINK.supervise(&mut station), keeps reconnecting
//! spawner.spawn(mqtt_task(stack, &MQTT, &STATE))?; // MQTT.run(stack, &config, &STATE)
//! SoilMonitor::new(sensor, session).run().await
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod link;
pub mod monitor;
pub mod mqtt;
pub mod sensor;
pub mod session;
pub mod settings;

// Re-export key types for easier access at the crate root.
pub use app::boot;
pub use link::{LinkOutcome, LinkSupervisor, SharedLinkSupervisor};
pub use monitor::SoilMonitor;
pub use mqtt::{MqttSession, QoS, TcpTransport};
pub use sensor::{MoistureSensor, Stemma};
pub use session::{SessionClient, SessionState};
