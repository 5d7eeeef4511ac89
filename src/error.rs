//! # Error Types
//!
//! Errors for every layer of the node: the sensor bus, publishing, the
//! settings store, startup, and the MQTT transport underneath the session.
//!
//! Steady-state errors (a failed sample, a refused publish) are returned to
//! the caller and logged there. Only the startup errors are fatal.

use core::fmt;

/// Failure of a sensor operation.
///
/// Generic over the bus error `E`, which is passed through untouched so the
/// caller can inspect it with [`embedded_hal::i2c::Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError<E> {
    /// `read_moisture` was called before `initialize`.
    NotInitialized,
    /// A bus phase did not complete within the transaction timeout.
    Timeout,
    /// The bus reported an error (no acknowledge, arbitration loss, ...).
    Bus(E),
}

impl<E: fmt::Debug> fmt::Display for SensorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => f.write_str("sensor not initialized"),
            Self::Timeout => f.write_str("bus transaction timed out"),
            Self::Bus(e) => write!(f, "bus error: {e:?}"),
        }
    }
}

/// Why a publish request was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishError {
    /// The request was refused outright (session not started or not
    /// connected, oversize topic or payload, unsupported QoS).
    Rejected,
    /// The outbox has no room for another message.
    OutboxFull,
}

impl PublishError {
    /// The negative sentinel used for this outcome in diagnostics.
    pub const fn code(self) -> i32 {
        match self {
            Self::Rejected => -1,
            Self::OutboxFull => -2,
        }
    }
}

/// Error of a settings store `init` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError<E> {
    /// The partition has no free pages left.
    NoFreePages,
    /// The partition was written by a newer layout version.
    NewVersionFound,
    /// Any other failure of the store.
    Other(E),
}

/// The settings store could not be brought up, even after erasing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingsError<E> {
    /// Erasing the partition failed.
    Erase(E),
    /// Initialisation failed.
    Init(StoreError<E>),
}

/// A fatal startup failure. The node halts instead of running degraded.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartupError<S, B, W> {
    /// The settings store is unusable.
    Settings(SettingsError<S>),
    /// The sensor bus could not be configured.
    Sensor(B),
    /// The wireless station could not be configured or started.
    Link(W),
}

/// A broker URI that cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UriError {
    MissingScheme,
    /// Only `mqtt://` (plain TCP) is supported.
    UnsupportedScheme,
    MissingHost,
    InvalidPort,
}

/// The primary error enum of the MQTT transport.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying stream.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReturnCode),
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
}

impl<T> From<ProtocolError> for MqttError<T> {
    fn from(err: ProtocolError) -> Self {
        MqttError::Protocol(err)
    }
}

/// Error of the packet encoders, which never touch a transport.
pub type CodecError = MqttError<core::convert::Infallible>;

impl<T> MqttError<T> {
    /// Lifts an encoder error into the error of a concrete transport.
    pub fn from_codec(err: CodecError) -> Self {
        match err {
            MqttError::Transport(never) => match never {},
            MqttError::Protocol(e) => MqttError::Protocol(e),
            MqttError::ConnectionRefused(code) => MqttError::ConnectionRefused(code),
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
        }
    }
}

/// Represents the return codes of a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    /// The connection was accepted.
    Accepted,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// A code outside of the 3.1.1 range.
    Other(u8),
}

impl From<u8> for ConnectReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(val) => val,
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an unexpected packet.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// A packet does not fit the frame buffer.
    PacketTooLarge,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
}
