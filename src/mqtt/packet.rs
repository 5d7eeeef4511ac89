//! # MQTT Packet Structures and Serialization
//!
//! The subset of MQTT 3.1.1 a publishing node needs: CONNECT, PUBLISH,
//! PUBACK, PINGREQ and DISCONNECT on the way out; CONNACK, PUBLISH, PUBACK
//! and PINGRESP on the way in.
//!
//! Encoders write the fixed header, reserve four bytes for the remaining
//! length, write the body and then compact the header in place.

use crate::error::{CodecError, ConnectReturnCode, MqttError, ProtocolError};

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Largest value the remaining-length field can carry.
const MAX_REMAINING_LEN: usize = 268_435_455;
/// Bytes reserved for the remaining-length field while encoding.
const LEN_RESERVED: usize = 4;

const CONNECT: u8 = 0x10;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    /// Encodes the packet and returns its length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError>;
}

/// An inbound packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PingResp,
    /// A packet a publisher has no use for, identified by its type nibble.
    Other(u8),
}

/// Length of the first complete packet in `buf`, or `None` if more bytes
/// are needed.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let mut multiplier = 1;
    let mut value = 0;
    for i in 0..4 {
        let Some(&encoded_byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            let total = 1 + (i + 1) + value;
            return Ok((buf.len() >= total).then_some(total));
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedPacket)
}

/// Decodes one complete frame as returned by [`frame_len`].
pub fn decode(frame: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let header = *frame.first().ok_or(ProtocolError::MalformedPacket)?;
    let mut reader = Reader::new(frame);
    reader.skip(1)?;
    let remaining_len = reader.variable_byte_integer()?;
    let body = reader.take(remaining_len)?;

    let packet = match header >> 4 {
        2 => Packet::ConnAck(ConnAck::decode(body)?),
        3 => Packet::Publish(Publish::decode(header, body)?),
        4 => Packet::PubAck(PubAck::decode(body)?),
        13 => Packet::PingResp,
        0 | 15 => return Err(ProtocolError::InvalidPacketType(header >> 4)),
        other => Packet::Other(other),
    };
    Ok(packet)
}

// --- CONNECT Packet ---
#[derive(Debug, Clone, Copy)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
        }
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut flags = 0;
        if self.clean_session {
            flags |= 0x02;
        }
        if self.username.is_some() {
            flags |= 0x80;
            // A password without a username is not allowed in 3.1.1.
            if self.password.is_some() {
                flags |= 0x40;
            }
        }

        let mut w = Writer::packet(buf, CONNECT)?;
        w.utf8_string("MQTT")?;
        w.u8(4)?;
        w.u8(flags)?;
        w.u16(self.keep_alive)?;
        w.utf8_string(self.client_id)?;
        if let Some(username) = self.username {
            w.utf8_string(username)?;
            if let Some(password) = self.password {
                w.utf8_string(password)?;
            }
        }
        w.finish()
    }
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let flags = r.u8()?;
        let return_code = ConnectReturnCode::from(r.u8()?);
        Ok(Self {
            session_present: (flags & 0x01) != 0,
            return_code,
        })
    }
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    /// Present for QoS 1 and 2.
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    fn decode(header: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let qos = match (header >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(ProtocolError::MalformedPacket),
        };

        let mut r = Reader::new(body);
        let topic = r.utf8_string()?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(r.u16()?)
        } else {
            None
        };

        Ok(Self {
            topic,
            qos,
            retain: (header & 0x01) != 0,
            payload: r.rest(),
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut header = PUBLISH | ((self.qos as u8) << 1);
        if self.retain {
            header |= 0x01;
        }

        let mut w = Writer::packet(buf, header)?;
        w.utf8_string(self.topic)?;
        if self.qos != QoS::AtMostOnce {
            let id = self
                .packet_id
                .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
            w.u16(id)?;
        }
        w.bytes(self.payload)?;
        w.finish()
    }
}

// --- PUBACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

impl PubAck {
    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            packet_id: Reader::new(body).u16()?,
        })
    }
}

impl EncodePacket for PubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::packet(buf, PUBACK)?;
        w.u16(self.packet_id)?;
        w.finish()
    }
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        fixed_two_bytes(buf, PINGREQ)
    }
}

// --- DISCONNECT Packet ---
#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        fixed_two_bytes(buf, DISCONNECT)
    }
}

fn fixed_two_bytes(buf: &mut [u8], header: u8) -> Result<usize, CodecError> {
    let out = buf.get_mut(..2).ok_or(MqttError::BufferTooSmall)?;
    out.copy_from_slice(&[header, 0x00]);
    Ok(2)
}

/// Writes a variable-byte integer to the start of `buf` and returns the
/// number of bytes used.
pub fn write_variable_byte_integer(buf: &mut [u8], mut val: usize) -> Result<usize, CodecError> {
    if val > MAX_REMAINING_LEN {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(MqttError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Bounds-checked packet writer.
struct Writer<'b> {
    buf: &'b mut [u8],
    cursor: usize,
}

impl<'b> Writer<'b> {
    /// Starts a packet with `header` and room for the remaining length.
    fn packet(buf: &'b mut [u8], header: u8) -> Result<Self, CodecError> {
        let mut w = Self { buf, cursor: 0 };
        w.u8(header)?;
        w.cursor += LEN_RESERVED;
        Ok(w)
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let end = self.cursor + data.len();
        self.buf
            .get_mut(self.cursor..end)
            .ok_or(MqttError::BufferTooSmall)?
            .copy_from_slice(data);
        self.cursor = end;
        Ok(())
    }

    fn u8(&mut self, val: u8) -> Result<(), CodecError> {
        self.bytes(&[val])
    }

    fn u16(&mut self, val: u16) -> Result<(), CodecError> {
        self.bytes(&val.to_be_bytes())
    }

    /// Writes a UTF-8 encoded string prefixed with its 2-byte length.
    fn utf8_string(&mut self, s: &str) -> Result<(), CodecError> {
        let len = u16::try_from(s.len())
            .map_err(|_| MqttError::Protocol(ProtocolError::PayloadTooLarge))?;
        self.u16(len)?;
        self.bytes(s.as_bytes())
    }

    /// Writes the remaining length and compacts the packet. Returns its length.
    fn finish(self) -> Result<usize, CodecError> {
        let content_start = 1 + LEN_RESERVED;
        if self.cursor > self.buf.len() {
            return Err(MqttError::BufferTooSmall);
        }
        let remaining_len = self.cursor - content_start;
        let len_bytes = write_variable_byte_integer(&mut self.buf[1..content_start], remaining_len)?;
        let header_len = 1 + len_bytes;
        self.buf.copy_within(content_start..self.cursor, header_len);
        Ok(header_len + remaining_len)
    }
}

/// Bounds-checked packet reader.
struct Reader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.cursor + len;
        let slice = self
            .buf
            .get(self.cursor..end)
            .ok_or(ProtocolError::MalformedPacket)?;
        self.cursor = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn variable_byte_integer(&mut self) -> Result<usize, ProtocolError> {
        let mut multiplier = 1;
        let mut value = 0;
        for _ in 0..4 {
            let encoded_byte = self.u8()?;
            value += (encoded_byte & 127) as usize * multiplier;
            if (encoded_byte & 128) == 0 {
                return Ok(value);
            }
            multiplier *= 128;
        }
        Err(ProtocolError::MalformedPacket)
    }

    fn utf8_string(&mut self) -> Result<&'a str, ProtocolError> {
        let len = self.u16()? as usize;
        core::str::from_utf8(self.take(len)?).map_err(|_| ProtocolError::InvalidUtf8String)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.cursor..];
        self.cursor = self.buf.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &impl EncodePacket) -> std::vec::Vec<u8> {
        let mut buf = [0u8; 128];
        let len = packet.encode(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn connect_with_credentials() {
        let mut connect = Connect::new("node", 120, true);
        connect.username = Some("u");
        connect.password = Some("pw");

        assert_eq!(
            encode(&connect),
            [
                0x10, 23, // fixed header
                0, 4, b'M', b'Q', b'T', b'T', 4, // protocol
                0xC2, // username + password + clean session
                0, 120, // keep alive
                0, 4, b'n', b'o', b'd', b'e', //
                0, 1, b'u', //
                0, 2, b'p', b'w',
            ]
        );
    }

    #[test]
    fn connect_ignores_password_without_username() {
        let mut connect = Connect::new("n", 60, true);
        connect.password = Some("pw");

        let bytes = encode(&connect);
        assert_eq!(bytes[9], 0x02);
        assert_eq!(bytes.len(), 2 + 10 + 3);
    }

    #[test]
    fn publish_qos0_has_no_packet_id() {
        let publish = Publish {
            topic: "/topic/soil-moisture",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: b"600",
            packet_id: None,
        };

        let bytes = encode(&publish);
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[1] as usize, 2 + 20 + 3);
        assert_eq!(&bytes[4..24], b"/topic/soil-moisture");
        assert_eq!(&bytes[24..], b"600");
    }

    #[test]
    fn publish_qos1_retained_carries_id() {
        let publish = Publish {
            topic: "t",
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: b"x",
            packet_id: Some(0x0102),
        };

        assert_eq!(encode(&publish), [0x33, 6, 0, 1, b't', 0x01, 0x02, b'x']);
    }

    #[test]
    fn encode_reports_small_buffer() {
        let publish = Publish {
            topic: "a/long/topic",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: b"payload",
            packet_id: None,
        };
        let mut buf = [0u8; 8];

        assert!(matches!(publish.encode(&mut buf), Err(MqttError::BufferTooSmall)));
    }

    #[test]
    fn long_remaining_length_uses_two_bytes() {
        let payload = [0xAAu8; 200];
        let publish = Publish {
            topic: "t",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: &payload,
            packet_id: None,
        };
        let mut buf = [0u8; 256];
        let len = publish.encode(&mut buf).unwrap();

        // 3 bytes of topic + 200 payload = 203 = 0xCB 0x01
        assert_eq!(&buf[..3], &[0x30, 0xCB, 0x01]);
        assert_eq!(len, 3 + 203);
        assert_eq!(frame_len(&buf[..len]), Ok(Some(len)));
    }

    #[test]
    fn frame_len_waits_for_the_whole_packet() {
        assert_eq!(frame_len(&[]), Ok(None));
        assert_eq!(frame_len(&[0x20]), Ok(None));
        assert_eq!(frame_len(&[0x20, 0x02, 0x00]), Ok(None));
        assert_eq!(frame_len(&[0x20, 0x02, 0x00, 0x00, 0xD0]), Ok(Some(4)));
        assert_eq!(
            frame_len(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn decodes_connack() {
        assert_eq!(
            decode(&[0x20, 0x02, 0x01, 0x05]),
            Ok(Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::NotAuthorized,
            }))
        );
    }

    #[test]
    fn decodes_puback_and_pingresp() {
        assert_eq!(
            decode(&[0x40, 0x02, 0x00, 0x07]),
            Ok(Packet::PubAck(PubAck { packet_id: 7 }))
        );
        assert_eq!(decode(&[0xD0, 0x00]), Ok(Packet::PingResp));
        assert_eq!(decode(&[0x90, 0x03, 0x00, 0x01, 0x00]), Ok(Packet::Other(9)));
    }

    #[test]
    fn decodes_inbound_publish() {
        let frame = [0x32, 0x08, 0x00, 0x03, b'c', b'm', b'd', 0x00, 0x09, b'!'];

        assert_eq!(
            decode(&frame),
            Ok(Packet::Publish(Publish {
                topic: "cmd",
                qos: QoS::AtLeastOnce,
                retain: false,
                payload: b"!",
                packet_id: Some(9),
            }))
        );
    }

    #[test]
    fn rejects_truncated_and_reserved_packets() {
        assert_eq!(decode(&[0x40, 0x02, 0x00]), Err(ProtocolError::MalformedPacket));
        assert_eq!(decode(&[0xF0, 0x00]), Err(ProtocolError::InvalidPacketType(15)));
        assert_eq!(
            decode(&[0x30, 0x04, 0x00, 0x02, 0xFF, 0xFE]),
            Err(ProtocolError::InvalidUtf8String)
        );
    }

    #[test]
    fn fixed_packets() {
        assert_eq!(encode(&PingReq), [0xC0, 0x00]);
        assert_eq!(encode(&Disconnect), [0xE0, 0x00]);
        assert_eq!(encode(&PubAck { packet_id: 3 }), [0x40, 0x02, 0x00, 0x03]);
    }
}
