//! # MQTT Session
//!
//! A publisher-side MQTT 3.1.1 session that runs on its own task.
//!
//! [`MqttSession`] is shared between two parties:
//!
//! - the control side enqueues messages through [`SessionTransport`]
//!   (implemented for `&MqttSession`) without ever waiting on the network;
//! - [`MqttSession::run`] owns the TCP connection: it connects, drains the
//!   outbox, answers the broker and reports everything to one
//!   [`SessionEventHandler`]. When the connection drops it waits and
//!   reconnects.
//!
//! QoS 0 messages are only accepted while the broker is reachable. QoS 1
//! messages are queued and go out after the next connect.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{Either, select};
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Ipv4Address, Stack};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use heapless::{String, Vec};

use super::packet::{self, Connect, Disconnect, EncodePacket, Packet, PingReq, PubAck, Publish, QoS};
use super::transport::{MqttTransport, TcpTransport, TransportError, connect_errno};
use crate::config::{BrokerUri, SessionConfig};
use crate::error::{ConnectReturnCode, MqttError, ProtocolError, PublishError};
use crate::fmt::Dbg;
use crate::session::{MessageId, SessionEvent, SessionEventHandler, SessionFault, SessionTransport};

/// Longest topic the outbox stores.
pub const MAX_TOPIC_LEN: usize = 64;
/// Largest payload the outbox stores.
pub const MAX_PAYLOAD_LEN: usize = 64;
/// Size of the packet buffers in each direction.
pub const FRAME_LEN: usize = 256;
/// Size of each TCP socket buffer.
pub const SOCKET_BUFFER_LEN: usize = 1024;

/// A message waiting in the outbox, with inline storage for topic and payload.
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
    pub qos: QoS,
    pub retain: bool,
    pub message_id: MessageId,
}

/// Session shared by the control task and the network task.
pub struct MqttSession<M: RawMutex, const DEPTH: usize> {
    outbox: Channel<M, OutboundPublish, DEPTH>,
    start: Signal<M, ()>,
    started: AtomicBool,
    online: AtomicBool,
    next_id: Mutex<M, Cell<MessageId>>,
}

impl<M: RawMutex, const DEPTH: usize> MqttSession<M, DEPTH> {
    pub const fn new() -> Self {
        Self {
            outbox: Channel::new(),
            start: Signal::new(),
            started: AtomicBool::new(false),
            online: AtomicBool::new(false),
            next_id: Mutex::new(Cell::new(1)),
        }
    }

    /// Lets [`run`](Self::run) begin connecting.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.start.signal(());
        }
    }

    /// Whether a CONNACK has been accepted on the current connection.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Number of messages waiting for the network task.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Validates a message and puts it into the outbox.
    pub fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        if !self.started.load(Ordering::Acquire) || qos == QoS::ExactlyOnce {
            return Err(PublishError::Rejected);
        }
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(PublishError::Rejected);
        }
        if qos == QoS::AtMostOnce && !self.is_online() {
            return Err(PublishError::Rejected);
        }

        let topic = String::try_from(topic).map_err(|_| PublishError::Rejected)?;
        let payload = Vec::from_slice(payload).map_err(|_| PublishError::Rejected)?;
        let message_id = match qos {
            QoS::AtMostOnce => 0,
            _ => self.next_message_id(),
        };

        self.outbox
            .try_send(OutboundPublish {
                topic,
                payload,
                qos,
                retain,
                message_id,
            })
            .map_err(|_| PublishError::OutboxFull)?;
        Ok(message_id)
    }

    /// Drops QoS 0 messages left over from a lost connection. QoS 1
    /// messages stay queued in their original order.
    fn discard_stale(&self) {
        for _ in 0..self.outbox.len() {
            let Ok(message) = self.outbox.try_receive() else {
                break;
            };
            if message.qos == QoS::AtMostOnce {
                debug!("mqtt: dropping stale publish to '{}'", message.topic.as_str());
            } else if self.outbox.try_send(message).is_err() {
                warn!("mqtt: outbox refilled while requeueing, publish lost");
            }
        }
    }

    fn next_message_id(&self) -> MessageId {
        self.next_id.lock(|cell| {
            let id = cell.get();
            cell.set(id.checked_add(1).unwrap_or(1));
            id
        })
    }

    /// Drives the session forever: waits for [`start`](Self::start), then
    /// connects to the broker and reconnects after every failure.
    pub async fn run<H: SessionEventHandler>(
        &self,
        stack: Stack<'_>,
        config: &SessionConfig<'_>,
        handler: &H,
    ) -> ! {
        self.start.wait().await;

        let uri = match BrokerUri::parse(config.broker_uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!("mqtt: unusable broker uri: {:?}", e);
                handler.on_event(&SessionEvent::Error(SessionFault::other()));
                loop {
                    core::future::pending::<()>().await;
                }
            }
        };

        let mut rx_buffer = [0u8; SOCKET_BUFFER_LEN];
        let mut tx_buffer = [0u8; SOCKET_BUFFER_LEN];

        loop {
            stack.wait_config_up().await;

            match resolve(stack, uri.host).await {
                Ok(address) => {
                    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
                    // Idle reads ping well before the socket gives up.
                    socket.set_timeout(Some(config.network_timeout * 3));
                    info!("mqtt: connecting to {}:{}", uri.host, uri.port);

                    match socket.connect((address, uri.port)).await {
                        Ok(()) => {
                            let mut transport = TcpTransport::new(socket, config.network_timeout);
                            let err = self.serve(&mut transport, config, handler).await;
                            warn!("mqtt: connection ended: {:?}", Dbg(&err));
                            let mut socket = transport.into_inner();
                            let _ = socket.flush().await;
                        }
                        Err(e) => {
                            warn!("mqtt: tcp connect failed: {:?}", Dbg(&e));
                            let fault = SessionFault::socket(connect_errno(e));
                            handler.on_event(&SessionEvent::Error(fault));
                        }
                    }
                }
                Err(fault) => handler.on_event(&SessionEvent::Error(fault)),
            }

            Timer::after(config.reconnect_delay).await;
        }
    }

    /// Runs one MQTT connection over `transport` until it fails.
    ///
    /// Reports `Connected` once the broker accepts the session and, if it
    /// did, `Disconnected` when the connection is lost. Returns the error
    /// that ended the connection.
    pub async fn serve<T, H>(
        &self,
        transport: &mut T,
        config: &SessionConfig<'_>,
        handler: &H,
    ) -> MqttError<T::Error>
    where
        T: MqttTransport,
        H: SessionEventHandler,
    {
        self.discard_stale();
        let mut link = Link {
            transport,
            inbox: Inbox::new(),
            tx: [0u8; FRAME_LEN],
        };

        if let Err(err) = link.handshake(config).await {
            handler.on_event(&SessionEvent::Error(fault_of(&err)));
            return err;
        }

        self.online.store(true, Ordering::Release);
        handler.on_event(&SessionEvent::Connected);

        let err = match self.pump(&mut link, handler).await {
            Ok(never) => match never {},
            Err(err) => err,
        };

        self.online.store(false, Ordering::Release);
        self.discard_stale();
        if !matches!(err, MqttError::Transport(_)) {
            // The socket still works, so close the session properly.
            let _ = link.send(&Disconnect).await;
        }
        handler.on_event(&SessionEvent::Error(fault_of(&err)));
        handler.on_event(&SessionEvent::Disconnected);
        err
    }

    async fn pump<T, H>(
        &self,
        link: &mut Link<'_, T>,
        handler: &H,
    ) -> Result<core::convert::Infallible, MqttError<T::Error>>
    where
        T: MqttTransport,
        H: SessionEventHandler,
    {
        loop {
            while let Some(len) = link.inbox.frame()? {
                link.dispatch(len, handler).await?;
                link.inbox.consume(len);
            }

            let next = select(
                self.outbox.receive(),
                link.transport.recv(link.inbox.spare()),
            )
            .await;

            match next {
                Either::First(message) => link.publish(&message).await?,
                Either::Second(Ok(n)) => link.inbox.advance(n),
                Either::Second(Err(e)) if e.is_timeout() => {
                    trace!("mqtt: idle, sending ping");
                    link.send(&PingReq).await?;
                }
                Either::Second(Err(e)) => return Err(MqttError::Transport(e)),
            }
        }
    }
}

impl<M: RawMutex, const DEPTH: usize> Default for MqttSession<M, DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const DEPTH: usize> SessionTransport for &MqttSession<M, DEPTH> {
    fn start(&mut self) {
        MqttSession::start(self)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, PublishError> {
        self.enqueue(topic, payload, qos, retain)
    }
}

/// One open connection: the transport plus its packet buffers.
struct Link<'t, T> {
    transport: &'t mut T,
    inbox: Inbox,
    tx: [u8; FRAME_LEN],
}

impl<T: MqttTransport> Link<'_, T> {
    async fn send(&mut self, packet: &impl EncodePacket) -> Result<(), MqttError<T::Error>> {
        let len = packet.encode(&mut self.tx).map_err(MqttError::from_codec)?;
        self.transport
            .send(&self.tx[..len])
            .await
            .map_err(MqttError::Transport)
    }

    async fn handshake(&mut self, config: &SessionConfig<'_>) -> Result<(), MqttError<T::Error>> {
        let connect = Connect {
            client_id: config.client_id,
            keep_alive: config.keep_alive_secs,
            clean_session: true,
            username: config.username,
            password: config.password,
        };
        self.send(&connect).await?;

        let ack = loop {
            if let Some(len) = self.inbox.frame()? {
                let ack = match packet::decode(self.inbox.get(len))? {
                    Packet::ConnAck(ack) => ack,
                    _ => return Err(ProtocolError::InvalidResponse.into()),
                };
                self.inbox.consume(len);
                break ack;
            }
            match self.transport.recv(self.inbox.spare()).await {
                Ok(n) => self.inbox.advance(n),
                Err(e) => return Err(MqttError::Transport(e)),
            }
        };

        match ack.return_code {
            ConnectReturnCode::Accepted => Ok(()),
            code => {
                warn!("mqtt: broker refused connection: {:?}", code);
                Err(MqttError::ConnectionRefused(code))
            }
        }
    }

    async fn publish(&mut self, message: &OutboundPublish) -> Result<(), MqttError<T::Error>> {
        let publish = Publish {
            topic: &message.topic,
            qos: message.qos,
            retain: message.retain,
            payload: &message.payload,
            packet_id: (message.qos != QoS::AtMostOnce).then_some(message.message_id),
        };
        self.send(&publish).await?;
        trace!("mqtt: sent publish to '{}', msg_id={}", message.topic.as_str(), message.message_id);
        Ok(())
    }

    async fn dispatch<H: SessionEventHandler>(
        &mut self,
        len: usize,
        handler: &H,
    ) -> Result<(), MqttError<T::Error>> {
        let mut ack = None;
        match packet::decode(self.inbox.get(len))? {
            Packet::PubAck(puback) => handler.on_event(&SessionEvent::Published {
                message_id: puback.packet_id,
            }),
            Packet::Publish(publish) => {
                handler.on_event(&SessionEvent::Data {
                    topic: publish.topic,
                    payload: publish.payload,
                });
                if publish.qos == QoS::AtLeastOnce {
                    ack = publish.packet_id;
                }
            }
            Packet::PingResp => trace!("mqtt: ping response"),
            Packet::ConnAck(_) => return Err(ProtocolError::InvalidResponse.into()),
            Packet::Other(kind) => debug!("mqtt: ignoring packet type {}", kind),
        }

        if let Some(packet_id) = ack {
            self.send(&PubAck { packet_id }).await?;
        }
        Ok(())
    }
}

/// Reassembles packets from arbitrary stream chunks.
struct Inbox {
    buf: [u8; FRAME_LEN],
    filled: usize,
}

impl Inbox {
    const fn new() -> Self {
        Self {
            buf: [0u8; FRAME_LEN],
            filled: 0,
        }
    }

    /// Length of the first complete packet, if one is buffered.
    fn frame(&self) -> Result<Option<usize>, ProtocolError> {
        match packet::frame_len(&self.buf[..self.filled])? {
            None if self.filled == FRAME_LEN => Err(ProtocolError::PacketTooLarge),
            Some(len) if len > FRAME_LEN => Err(ProtocolError::PacketTooLarge),
            frame => Ok(frame),
        }
    }

    fn get(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    fn consume(&mut self, len: usize) {
        self.buf.copy_within(len..self.filled, 0);
        self.filled -= len;
    }

    fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(FRAME_LEN);
    }
}

fn fault_of<E: TransportError>(err: &MqttError<E>) -> SessionFault {
    match err {
        MqttError::Transport(e) => SessionFault::socket(e.socket_errno()),
        MqttError::ConnectionRefused(code) => SessionFault::refused((*code).into()),
        MqttError::Protocol(_) | MqttError::BufferTooSmall => SessionFault::other(),
    }
}

/// Resolves `host` to an address: IPv4 literals directly, names over DNS.
async fn resolve(stack: Stack<'_>, host: &str) -> Result<IpAddress, SessionFault> {
    if let Ok(address) = host.parse::<Ipv4Address>() {
        return Ok(IpAddress::Ipv4(address));
    }

    match stack.dns_query(host, DnsQueryType::A).await {
        Ok(addresses) => addresses.first().copied().ok_or_else(|| {
            warn!("mqtt: no address for {}", host);
            SessionFault::other()
        }),
        Err(e) => {
            warn!("mqtt: dns lookup of {} failed: {:?}", host, Dbg(&e));
            Err(SessionFault::other())
        }
    }
}
