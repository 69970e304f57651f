//! MQTT 3.1.1 Framing
//!
//! The subset of the protocol the signaling transport needs: CONNECT,
//! CONNACK, SUBSCRIBE (QoS 0), SUBACK, PUBLISH (QoS 0 sent, QoS 0/1
//! parsed), PINGREQ, PINGRESP and DISCONNECT, with the variable-length
//! remaining-length encoding and a byte-stream reassembler for framing
//! over web-socket chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::FrameError;

/// MQTT protocol name in the CONNECT variable header.
const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level 4 = MQTT 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

/// CONNECT parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// An application message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub packet_id: Option<u16>,
}

/// Decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, return_code: u8 },
    Publish(Publish),
    Subscribe { packet_id: u16, topic: String, qos: u8 },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
    /// Packet type we do not speak; ignored by the session.
    Unsupported(u8),
}

impl Packet {
    /// Encode to a single wire frame.
    pub fn encode(&self) -> Bytes {
        let body = self.encode_body();
        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(self.type_and_flags());
        put_remaining_length(&mut frame, body.len());
        frame.put_slice(&body);
        frame.freeze()
    }

    fn type_and_flags(&self) -> u8 {
        match self {
            Self::Connect(_) => TYPE_CONNECT << 4,
            Self::ConnAck { .. } => TYPE_CONNACK << 4,
            Self::Publish(p) => (TYPE_PUBLISH << 4) | (p.qos << 1),
            Self::Subscribe { .. } => (TYPE_SUBSCRIBE << 4) | 0x02,
            Self::SubAck { .. } => TYPE_SUBACK << 4,
            Self::PingReq => TYPE_PINGREQ << 4,
            Self::PingResp => TYPE_PINGRESP << 4,
            Self::Disconnect => TYPE_DISCONNECT << 4,
            Self::Unsupported(t) => t << 4,
        }
    }

    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::new();
        match self {
            Self::Connect(c) => {
                put_str(&mut body, PROTOCOL_NAME);
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive_secs);
                put_str(&mut body, &c.client_id);
                if let Some(username) = &c.username {
                    put_str(&mut body, username);
                }
                if let Some(password) = &c.password {
                    put_str(&mut body, password);
                }
            }
            Self::ConnAck {
                session_present,
                return_code,
            } => {
                body.put_u8(u8::from(*session_present));
                body.put_u8(*return_code);
            }
            Self::Publish(p) => {
                put_str(&mut body, &p.topic);
                if p.qos > 0 {
                    body.put_u16(p.packet_id.unwrap_or(1));
                }
                body.put_slice(&p.payload);
            }
            Self::Subscribe {
                packet_id,
                topic,
                qos,
            } => {
                body.put_u16(*packet_id);
                put_str(&mut body, topic);
                body.put_u8(*qos);
            }
            Self::SubAck {
                packet_id,
                return_codes,
            } => {
                body.put_u16(*packet_id);
                body.put_slice(return_codes);
            }
            Self::PingReq | Self::PingResp | Self::Disconnect | Self::Unsupported(_) => {}
        }
        body
    }
}

/// MQTT variable-length remaining-length encoding, 1-4 bytes.
fn put_remaining_length(buf: &mut BytesMut, mut n: usize) {
    loop {
        let byte = (n % 0x80) as u8;
        n >>= 7;
        if n > 0 {
            buf.put_u8(0x80 | byte);
        } else {
            buf.put_u8(byte);
            break;
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::BadString);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::BadString);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::BadString)
}

/// Accumulates web-socket chunks and yields complete packets.
///
/// Web-socket transports may split or merge MQTT frames arbitrarily, so
/// the session feeds every binary chunk through here.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw transport bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete packet, if the buffer holds one.
    ///
    /// A remaining-length field that runs past its 4-byte bound discards
    /// the whole buffer: framing is lost at that point and resynchronizing
    /// mid-stream is not possible.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        let Some((header_len, remaining)) = self.peek_header()? else {
            return Ok(None);
        };
        if self.buf.len() < header_len + remaining {
            return Ok(None);
        }

        let first = self.buf[0];
        self.buf.advance(header_len);
        let body = self.buf.split_to(remaining).freeze();
        decode_packet(first, body).map(Some)
    }

    /// Parse the fixed header: returns (header length, remaining length),
    /// or `None` when more bytes are needed.
    fn peek_header(&mut self) -> Result<Option<(usize, usize)>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let mut remaining: usize = 0;
        let mut shift = 0u32;
        for (i, &byte) in self.buf.iter().skip(1).enumerate() {
            if i >= 4 {
                self.buf.clear();
                return Err(FrameError::LengthOverflow);
            }
            remaining |= usize::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(Some((i + 2, remaining)));
            }
        }
        if self.buf.len() >= 5 {
            // Five length bytes buffered, all with the continuation bit.
            self.buf.clear();
            return Err(FrameError::LengthOverflow);
        }
        Ok(None)
    }
}

/// Decode one packet body given its fixed-header byte.
fn decode_packet(first: u8, mut body: Bytes) -> Result<Packet, FrameError> {
    let packet_type = first >> 4;
    match packet_type {
        TYPE_CONNACK => {
            if body.remaining() < 2 {
                return Err(FrameError::BadPacket("connack"));
            }
            let flags = body.get_u8();
            let return_code = body.get_u8();
            Ok(Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                return_code,
            })
        }
        TYPE_PUBLISH => {
            let qos = (first >> 1) & 0x03;
            let topic = get_str(&mut body).map_err(|_| FrameError::BadPacket("publish"))?;
            let packet_id = if qos > 0 {
                if body.remaining() < 2 {
                    return Err(FrameError::BadPacket("publish"));
                }
                Some(body.get_u16())
            } else {
                None
            };
            Ok(Packet::Publish(Publish {
                topic,
                payload: body,
                qos,
                packet_id,
            }))
        }
        TYPE_SUBACK => {
            if body.remaining() < 2 {
                return Err(FrameError::BadPacket("suback"));
            }
            let packet_id = body.get_u16();
            Ok(Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            })
        }
        TYPE_PINGREQ => Ok(Packet::PingReq),
        TYPE_PINGRESP => Ok(Packet::PingResp),
        TYPE_DISCONNECT => Ok(Packet::Disconnect),
        TYPE_CONNECT => {
            // Only brokers parse CONNECT bodies; the mock broker in the
            // test suite does, so decode the fields we emit.
            let _protocol = get_str(&mut body).map_err(|_| FrameError::BadPacket("connect"))?;
            if body.remaining() < 4 {
                return Err(FrameError::BadPacket("connect"));
            }
            let _level = body.get_u8();
            let flags = body.get_u8();
            let keep_alive_secs = body.get_u16();
            let client_id = get_str(&mut body).map_err(|_| FrameError::BadPacket("connect"))?;
            let username = if flags & 0x80 != 0 {
                Some(get_str(&mut body).map_err(|_| FrameError::BadPacket("connect"))?)
            } else {
                None
            };
            let password = if flags & 0x40 != 0 {
                Some(get_str(&mut body).map_err(|_| FrameError::BadPacket("connect"))?)
            } else {
                None
            };
            Ok(Packet::Connect(Connect {
                client_id,
                keep_alive_secs,
                clean_session: flags & 0x02 != 0,
                username,
                password,
            }))
        }
        TYPE_SUBSCRIBE => {
            if body.remaining() < 2 {
                return Err(FrameError::BadPacket("subscribe"));
            }
            let packet_id = body.get_u16();
            let topic = get_str(&mut body).map_err(|_| FrameError::BadPacket("subscribe"))?;
            if body.remaining() < 1 {
                return Err(FrameError::BadPacket("subscribe"));
            }
            let qos = body.get_u8();
            Ok(Packet::Subscribe {
                packet_id,
                topic,
                qos,
            })
        }
        other => Ok(Packet::Unsupported(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_length(n: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_remaining_length(&mut buf, n);
        buf.to_vec()
    }

    #[test]
    fn remaining_length_boundaries() {
        assert_eq!(encode_length(0), [0x00]);
        assert_eq!(encode_length(127), [0x7F]);
        assert_eq!(encode_length(128), [0x80, 0x01]);
        assert_eq!(encode_length(16_383), [0xFF, 0x7F]);
        assert_eq!(encode_length(16_384), [0x80, 0x80, 0x01]);
        assert_eq!(encode_length(2_097_151), [0xFF, 0xFF, 0x7F]);
        assert_eq!(encode_length(2_097_152), [0x80, 0x80, 0x80, 0x01]);
        assert_eq!(encode_length(268_435_455), [0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn connect_round_trip() {
        let connect = Packet::Connect(Connect {
            client_id: "abc123-9f2e-Qx7z".into(),
            keep_alive_secs: 30,
            clean_session: true,
            username: Some("guest".into()),
            password: Some("guest".into()),
        });
        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&connect.encode());
        assert_eq!(reassembler.next_packet().unwrap(), Some(connect));
        assert_eq!(reassembler.next_packet().unwrap(), None);
    }

    #[test]
    fn publish_qos0_round_trip() {
        let publish = Packet::Publish(Publish {
            topic: "p2p-conf/room1".into(),
            payload: Bytes::from_static(br#"{"type":"announce"}"#),
            qos: 0,
            packet_id: None,
        });
        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&publish.encode());
        assert_eq!(reassembler.next_packet().unwrap(), Some(publish));
    }

    #[test]
    fn publish_qos1_skips_packet_id() {
        // Frame a QoS 1 PUBLISH by hand: topic "t", packet id 7, payload "x".
        let mut frame = BytesMut::new();
        frame.put_u8((TYPE_PUBLISH << 4) | 0x02);
        frame.put_u8(8);
        frame.put_u16(1);
        frame.put_slice(b"t");
        frame.put_u16(7);
        frame.put_slice(b"x");

        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&frame);
        let Packet::Publish(publish) = reassembler.next_packet().unwrap().unwrap() else {
            panic!("expected publish");
        };
        assert_eq!(publish.topic, "t");
        assert_eq!(publish.packet_id, Some(7));
        assert_eq!(&publish.payload[..], b"x");
    }

    #[test]
    fn split_delivery_reassembles() {
        let publish = Packet::Publish(Publish {
            topic: "p2p-conf/room1".into(),
            payload: Bytes::from(vec![0xAB; 300]),
            qos: 0,
            packet_id: None,
        });
        let frame = publish.encode();

        for split in 1..frame.len() {
            let mut reassembler = FrameReassembler::new();
            reassembler.extend(&frame[..split]);
            assert_eq!(reassembler.next_packet().unwrap(), None, "split at {split}");
            reassembler.extend(&frame[split..]);
            assert_eq!(reassembler.next_packet().unwrap(), Some(publish.clone()));
        }
    }

    #[test]
    fn two_packets_in_one_chunk() {
        let a = Packet::PingReq.encode();
        let b = Packet::Publish(Publish {
            topic: "t".into(),
            payload: Bytes::from_static(b"hi"),
            qos: 0,
            packet_id: None,
        })
        .encode();

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&a);
        chunk.extend_from_slice(&b);

        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&chunk);
        assert_eq!(reassembler.next_packet().unwrap(), Some(Packet::PingReq));
        assert!(matches!(
            reassembler.next_packet().unwrap(),
            Some(Packet::Publish(_))
        ));
        assert_eq!(reassembler.next_packet().unwrap(), None);
    }

    #[test]
    fn length_overflow_discards_buffer() {
        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&[TYPE_PUBLISH << 4, 0x80, 0x80, 0x80, 0x80, 0x80]);
        assert_eq!(
            reassembler.next_packet(),
            Err(FrameError::LengthOverflow)
        );
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn unknown_packet_type_is_surfaced_not_fatal() {
        let mut frame = BytesMut::new();
        frame.put_u8(5 << 4); // PUBREC, outside our subset
        frame.put_u8(2);
        frame.put_u16(9);
        let mut reassembler = FrameReassembler::new();
        reassembler.extend(&frame);
        assert_eq!(
            reassembler.next_packet().unwrap(),
            Some(Packet::Unsupported(5))
        );
    }
}
