//! # MQTT Transport Abstraction
//!
//! The [`MqttTransport`] trait hides the byte stream under the session so
//! the protocol runner can be driven by a TCP socket on the device and by a
//! scripted stream in tests.
//!
//! A transport read is bounded by a timeout. The runner treats a timeout as
//! an idle connection and answers it with a keep-alive ping, so transport
//! errors have to say whether they are one.

use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
use futures::future::{Either, select};

use crate::fmt::Dbg;

/// Connection reset by peer.
pub const ECONNRESET: i32 = 104;
/// Transport endpoint is not connected.
pub const ENOTCONN: i32 = 107;
/// Connection timed out.
pub const ETIMEDOUT: i32 = 110;
/// No route to host.
pub const EHOSTUNREACH: i32 = 113;
/// Generic I/O error.
pub const EIO: i32 = 5;

/// A trait representing a transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: TransportError;

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read, never zero.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Classification every transport error provides.
pub trait TransportError: core::fmt::Debug {
    /// The read timed out without the connection failing.
    fn is_timeout(&self) -> bool;

    /// The `errno` value to report for this error, `0` if none applies.
    fn socket_errno(&self) -> i32 {
        0
    }
}

/// Errors of [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTransportError {
    /// Nothing arrived within the read timeout.
    Timeout,
    /// The broker closed the connection.
    Closed,
    /// The socket failed.
    Tcp(TcpError),
}

impl TransportError for TcpTransportError {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    fn socket_errno(&self) -> i32 {
        match self {
            Self::Timeout => ETIMEDOUT,
            Self::Closed => ENOTCONN,
            Self::Tcp(e) => tcp_errno(*e),
        }
    }
}

#[allow(unreachable_patterns)]
fn tcp_errno(e: TcpError) -> i32 {
    match e {
        TcpError::ConnectionReset => ECONNRESET,
        _ => EIO,
    }
}

/// `errno` for a failed TCP connect.
#[allow(unreachable_patterns)]
pub fn connect_errno(e: ConnectError) -> i32 {
    match e {
        ConnectError::ConnectionReset => ECONNRESET,
        ConnectError::TimedOut => ETIMEDOUT,
        ConnectError::NoRoute => EHOSTUNREACH,
        _ => EIO,
    }
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Wraps a connected socket. Reads give up after `timeout`.
    pub fn new(socket: TcpSocket<'a>, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Closes the socket and hands it back.
    pub fn into_inner(mut self) -> TcpSocket<'a> {
        self.socket.abort();
        self.socket
    }

    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, TcpTransportError> {
        let read_fut = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        match select(core::pin::pin!(read_fut), core::pin::pin!(timer)).await {
            Either::Left((Ok(0), _)) => {
                debug!("tcp: connection closed by peer");
                Err(TcpTransportError::Closed)
            }
            Either::Left((Ok(n), _)) => {
                trace!("tcp: read {} bytes", n);
                Ok(n)
            }
            Either::Left((Err(e), _)) => {
                warn!("tcp: read error: {:?}", Dbg(&e));
                Err(TcpTransportError::Tcp(e))
            }
            Either::Right(((), _)) => Err(TcpTransportError::Timeout),
        }
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Error = TcpTransportError;

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("tcp: write {} bytes", buf.len());

        self.socket.write_all(buf).await.map_err(|e| {
            warn!("tcp: write error: {:?}", Dbg(&e));
            TcpTransportError::Tcp(e)
        })?;

        self.socket.flush().await.map_err(TcpTransportError::Tcp)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_count_as_idle() {
        assert!(TcpTransportError::Timeout.is_timeout());
        assert!(!TcpTransportError::Closed.is_timeout());
        assert!(!TcpTransportError::Tcp(TcpError::ConnectionReset).is_timeout());
    }

    #[test]
    fn errors_map_to_errno() {
        assert_eq!(TcpTransportError::Tcp(TcpError::ConnectionReset).socket_errno(), ECONNRESET);
        assert_eq!(TcpTransportError::Closed.socket_errno(), ENOTCONN);
        assert_eq!(connect_errno(ConnectError::NoRoute), EHOSTUNREACH);
        assert_eq!(connect_errno(ConnectError::TimedOut), ETIMEDOUT);
    }
}
