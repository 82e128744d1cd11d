//! LOB Packet Framing
//!
//! Wire format:
//! [Head length: 2 bytes big-endian][Head: variable][Body: remainder]
//!
//! A head of exactly one byte marks a handshake; the byte is the CSID.
//! A decrypted channel packet carries a compact binary header object
//! as its head.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Minimum message size (head length prefix)
pub const MIN_MESSAGE_SIZE: usize = 2;

/// Maximum message size (including overhead)
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Size of the demux token leading a line packet body
pub const TOKEN_SIZE: usize = 16;

/// A length-prefixed object-plus-body packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet head (empty, one CSID byte, or an encoded header object)
    pub head: Bytes,

    /// Packet body
    pub body: Bytes,
}

impl Packet {
    /// Create a packet from head and body
    pub fn new(head: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            head: head.into(),
            body: body.into(),
        }
    }

    /// Create a handshake packet for the given CSID
    pub fn handshake(csid: u8, body: impl Into<Bytes>) -> Self {
        Self::new(vec![csid], body)
    }

    /// Create a head-less packet (line packet on the wire)
    pub fn plain(body: impl Into<Bytes>) -> Self {
        Self::new(Bytes::new(), body)
    }

    /// Create a channel packet from a header object
    pub fn channel(header: &ChannelHeader, body: impl Into<Bytes>) -> NetResult<Self> {
        let head = bincode::serialize(header)
            .map_err(|e| NetError::InvalidPacket(e.to_string()))?;
        Ok(Self::new(head, body))
    }

    /// Is this a handshake packet?
    pub fn is_handshake(&self) -> bool {
        self.head.len() == 1
    }

    /// The CSID of a handshake packet
    pub fn csid(&self) -> Option<u8> {
        if self.is_handshake() {
            Some(self.head[0])
        } else {
            None
        }
    }

    /// Decode the head as a channel header object
    pub fn channel_header(&self) -> NetResult<ChannelHeader> {
        bincode::deserialize(&self.head).map_err(|e| NetError::InvalidPacket(e.to_string()))
    }

    /// Serialize the packet to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_MESSAGE_SIZE + self.head.len() + self.body.len());
        buf.put_u16(self.head.len() as u16);
        buf.put_slice(&self.head);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Deserialize a packet from wire bytes
    pub fn decode(msg: &[u8]) -> NetResult<Self> {
        if msg.len() < MIN_MESSAGE_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "message too short: {} bytes",
                msg.len()
            )));
        }

        let mut buf = Bytes::copy_from_slice(msg);
        let head_len = buf.get_u16() as usize;
        if buf.len() < head_len {
            return Err(NetError::InvalidPacket(format!(
                "head length {} exceeds message",
                head_len
            )));
        }

        let head = buf.split_to(head_len);
        Ok(Self { head, body: buf })
    }

    /// Total encoded size
    pub fn size(&self) -> usize {
        MIN_MESSAGE_SIZE + self.head.len() + self.body.len()
    }
}

/// Check whether raw wire bytes carry a handshake (head length 1)
pub fn is_handshake_message(msg: &[u8]) -> bool {
    msg.len() >= 3 && msg[0] == 0 && msg[1] == 1
}

/// Extract the demux token of a head-less line packet
pub fn message_token(msg: &[u8]) -> Option<[u8; TOKEN_SIZE]> {
    if msg.len() < MIN_MESSAGE_SIZE + TOKEN_SIZE || msg[0] != 0 || msg[1] != 0 {
        return None;
    }

    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(&msg[MIN_MESSAGE_SIZE..MIN_MESSAGE_SIZE + TOKEN_SIZE]);
    Some(token)
}

/// A LAN address advertised during peer introduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddr {
    pub ip: String,
    pub port: u16,
}

/// The header object of a channel packet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelHeader {
    /// Channel id
    pub c: u32,

    /// Channel type; required on the first packet sent by each side
    pub typ: Option<String>,

    /// Sequence number; required on every reliable data packet
    pub seq: Option<u32>,

    /// Highest contiguous received sequence
    pub ack: Option<u32>,

    /// Missing sequences above `ack`, ascending
    pub miss: Option<Vec<u32>>,

    /// The sender is done sending
    pub end: bool,

    /// Abnormal termination reason
    pub err: Option<String>,

    /// Introduction target hashname (`peer` channels)
    pub peer: Option<String>,

    /// Advertised LAN address (`peer` channels)
    pub local: Option<LocalAddr>,

    /// Observed IP of the introduced peer (`connect` channels)
    pub ip: Option<String>,

    /// Observed port of the introduced peer (`connect` channels)
    pub port: Option<u16>,
}

impl ChannelHeader {
    /// Create a header for the given channel id
    pub fn new(c: u32) -> Self {
        Self {
            c,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let original = Packet::new(vec![1u8, 2, 3], vec![4u8, 5, 6, 7]);
        let decoded = Packet::decode(&original.encode()).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_empty_head_roundtrip() {
        let original = Packet::plain(vec![9u8; 40]);
        let decoded = Packet::decode(&original.encode()).unwrap();

        assert_eq!(original, decoded);
        assert!(!decoded.is_handshake());
    }

    #[test]
    fn test_handshake_detection() {
        let pkt = Packet::handshake(0x3a, vec![0u8; 64]);
        let msg = pkt.encode();

        assert!(is_handshake_message(&msg));
        assert_eq!(Packet::decode(&msg).unwrap().csid(), Some(0x3a));

        let plain = Packet::plain(vec![0u8; 64]).encode();
        assert!(!is_handshake_message(&plain));
    }

    #[test]
    fn test_message_token() {
        let mut body = vec![0u8; 40];
        for (i, b) in body.iter_mut().enumerate().take(TOKEN_SIZE) {
            *b = i as u8;
        }
        let msg = Packet::plain(body).encode();

        let token = message_token(&msg).unwrap();
        assert_eq!(token[3], 3);

        // Handshakes have no token
        let msg = Packet::handshake(0x3a, vec![0u8; 40]).encode();
        assert!(message_token(&msg).is_none());
    }

    #[test]
    fn test_decode_truncated() {
        assert!(Packet::decode(&[0x00]).is_err());

        // Head length larger than the message
        assert!(Packet::decode(&[0x00, 0x10, 0x01]).is_err());
    }

    #[test]
    fn test_channel_header_roundtrip() {
        let mut header = ChannelHeader::new(42);
        header.typ = Some("echo".into());
        header.seq = Some(7);
        header.ack = Some(6);
        header.miss = Some(vec![2, 4]);
        header.end = true;

        let pkt = Packet::channel(&header, vec![1u8, 2, 3]).unwrap();
        let decoded = Packet::decode(&pkt.encode()).unwrap();

        assert_eq!(decoded.channel_header().unwrap(), header);
        assert_eq!(&decoded.body[..], &[1, 2, 3]);
    }

    #[test]
    fn test_channel_header_rejects_garbage() {
        let pkt = Packet::new(vec![0xffu8; 3], Bytes::new());
        assert!(pkt.channel_header().is_err());
    }
}
