//! # Broker Session Client
//!
//! Tracks whether the broker session is up and forwards publish requests to
//! the underlying transport.
//!
//! The transport runs on its own execution context and reports lifecycle
//! changes through a single [`SessionEventHandler`]. [`SessionState`] is that
//! handler: it owns the connected flag and is the only code that flips it,
//! on `Connected` and `Disconnected`. The control task only ever reads it.
//!
//! Reading the flag and then publishing is not atomic. A publish issued
//! right after the broker dropped can still be refused by the transport,
//! which callers treat as an ordinary outcome.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::PublishError;
use crate::fmt::Dbg;
use crate::mqtt::QoS;

/// Identifier the transport assigns to an accepted publish.
pub type MessageId = u16;

/// Category of a session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCategory {
    /// The network transport (TCP, TLS) failed.
    Transport,
    /// The broker refused the connection with the given CONNACK code.
    ConnectionRefused(u8),
    /// Anything else, e.g. an unusable broker address.
    Other,
}

/// Diagnostics attached to a session error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionFault {
    pub category: ErrorCategory,
    /// Error reported by the platform transport layer.
    pub transport_error: i32,
    /// Error reported by the secure-transport stack.
    pub tls_stack_error: i32,
    /// `errno` captured from the socket.
    pub socket_errno: i32,
}

impl SessionFault {
    /// A transport fault carrying only a socket errno.
    pub const fn socket(socket_errno: i32) -> Self {
        Self {
            category: ErrorCategory::Transport,
            transport_error: 0,
            tls_stack_error: 0,
            socket_errno,
        }
    }

    pub const fn refused(code: u8) -> Self {
        Self {
            category: ErrorCategory::ConnectionRefused(code),
            transport_error: 0,
            tls_stack_error: 0,
            socket_errno: 0,
        }
    }

    pub const fn other() -> Self {
        Self {
            category: ErrorCategory::Other,
            transport_error: 0,
            tls_stack_error: 0,
            socket_errno: 0,
        }
    }
}

/// Lifecycle notification from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEvent<'a> {
    Connected,
    Disconnected,
    /// The broker acknowledged a publish.
    Published { message_id: MessageId },
    /// A message arrived on a subscribed topic.
    Data { topic: &'a str, payload: &'a [u8] },
    Error(SessionFault),
}

/// The callback the transport invokes for every [`SessionEvent`].
pub trait SessionEventHandler {
    fn on_event(&self, event: &SessionEvent<'_>);
}

/// The transport under the session client.
pub trait SessionTransport {
    /// Starts the session in the background. Connection results arrive later
    /// as events.
    fn start(&mut self);

    /// Hands a message to the transport without waiting for delivery.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError>;
}

impl<T: SessionTransport + ?Sized> SessionTransport for &mut T {
    fn start(&mut self) {
        (**self).start()
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        (**self).publish(topic, payload, qos, retain)
    }
}

/// The connected flag, shared by the transport's context and the control task.
#[derive(Debug, Default)]
pub struct SessionState {
    connected: AtomicBool,
}

impl SessionState {
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl SessionEventHandler for SessionState {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::Connected => {
                info!("session: connected");
                self.connected.store(true, Ordering::Release);
            }
            SessionEvent::Disconnected => {
                info!("session: disconnected");
                self.connected.store(false, Ordering::Release);
            }
            SessionEvent::Published { message_id } => {
                info!("session: published, msg_id={}", message_id);
            }
            SessionEvent::Data { topic, payload } => {
                info!("session: data on '{}' ({} bytes)", topic, payload.len());
            }
            SessionEvent::Error(fault) => {
                info!("session: error {:?}", fault.category);
                if fault.category == ErrorCategory::Transport {
                    log_if_nonzero("reported from transport", fault.transport_error);
                    log_if_nonzero("reported from tls stack", fault.tls_stack_error);
                    log_if_nonzero("captured as socket errno", fault.socket_errno);
                }
            }
        }
    }
}

fn log_if_nonzero(what: &str, code: i32) {
    if code != 0 {
        error!("session: last error {}: {:#x}", what, code);
    }
}

/// Client side of the broker session.
pub struct SessionClient<'s, T> {
    state: &'s SessionState,
    transport: T,
}

impl<'s, T: SessionTransport> SessionClient<'s, T> {
    /// Binds the client to the shared state the transport reports into.
    pub fn new(state: &'s SessionState, transport: T) -> Self {
        Self { state, transport }
    }

    /// Starts the session. Success or failure to connect shows up later
    /// through the event handler.
    pub fn start(&mut self) {
        self.transport.start();
        info!("session: client started");
    }

    /// Current session state. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Forwards a publish to the transport.
    ///
    /// The connected flag is not consulted here; callers check
    /// [`is_connected`](Self::is_connected) first. Acceptance only means the
    /// transport took the message.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        let result = self.transport.publish(topic, payload, qos, retain);
        if let Err(e) = &result {
            debug!("session: publish to '{}' refused: {:?}", topic, Dbg(e));
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
