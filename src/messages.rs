use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;

use crate::error::{ExchangeError, Result};

pub const PROFILE_COMMON: u32 = 0x0000_0000;

pub const MSG_TYPE_NULL: u8 = 0x0D;
pub const MSG_TYPE_RMP_DELAYED_DELIVERY: u8 = 0x0E;
pub const MSG_TYPE_RMP_THROTTLE_FLOW: u8 = 0x0F;

pub const ANY_NODE_ID: u64 = u64::MAX;

bitflags! {
    /// Flags carried in the exchange header.
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct ExchangeHeaderFlags: u8 {
        const INITIATOR = 0x1;
        const ACK_ID    = 0x2;
        const NEEDS_ACK = 0x4;
    }
}

bitflags! {
    /// Per message flags shared between the exchange layer and the message layer.
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct MessageFlags: u16 {
        const DUPLICATE_MESSAGE    = 0x0001;
        const PEER_REQUESTED_ACK   = 0x0002;
        /// Hint: the sender keeps the payload for a resend, a layer that queues
        /// buffers must copy it.
        const RETAIN_BUFFER        = 0x0004;
        const REUSE_MESSAGE_ID     = 0x0010;
        /// Hint: send from an ephemeral source port. [UdpMessageLayer](crate::transport::UdpMessageLayer)
        /// has a single socket and sends from the bound port.
        const VIA_EPHEMERAL_PORT   = 0x0020;
    }
}

/// Message protocol version. Reliable messaging requires [MessageVersion::V2].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageVersion {
    #[default]
    Unspecified,
    V1,
    V2,
}

impl MessageVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageVersion::Unspecified => 0,
            MessageVersion::V1 => 1,
            MessageVersion::V2 => 2,
        }
    }
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(MessageVersion::V1),
            2 => Ok(MessageVersion::V2),
            v => Err(ExchangeError::UnsupportedVersion(v)),
        }
    }
}

/// Metadata travelling with a message between the exchange layer and the message layer.
#[derive(Debug, Clone, Default)]
pub struct MessageInfo {
    pub message_id: u32,
    pub source_node_id: u64,
    pub dest_node_id: u64,
    pub flags: MessageFlags,
    pub version: MessageVersion,
    pub key_id: u16,
    pub encryption_type: u8,
    /// Address the message arrived from (receive side only).
    pub peer_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHeader {
    pub version: u8,
    pub flags: ExchangeHeaderFlags,
    pub message_type: u8,
    pub exchange_id: u16,
    pub profile_id: u32,
    /// Message id acknowledged by this message.
    pub ack_id: Option<u32>,
}

impl ExchangeHeader {
    pub const VERSION_V1: u8 = 1;

    pub fn new(exchange_id: u16, profile_id: u32, message_type: u8) -> Self {
        Self {
            version: Self::VERSION_V1,
            flags: ExchangeHeaderFlags::empty(),
            message_type,
            exchange_id,
            profile_id,
            ack_id: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.flags.contains(ExchangeHeaderFlags::INITIATOR)
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(ExchangeHeaderFlags::NEEDS_ACK)
    }

    pub fn encoded_len(&self) -> usize {
        if self.ack_id.is_some() {
            12
        } else {
            8
        }
    }

    /// Encode header; the ack id flag is derived from presence of `ack_id`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags = self.flags - ExchangeHeaderFlags::ACK_ID;
        if self.ack_id.is_some() {
            flags |= ExchangeHeaderFlags::ACK_ID;
        }
        let mut out = Vec::with_capacity(self.encoded_len());
        out.write_u8((self.version << 4) | (flags.bits() & 0x0f))?;
        out.write_u8(self.message_type)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u32::<LittleEndian>(self.profile_id)?;
        if let Some(ack_id) = self.ack_id {
            out.write_u32::<LittleEndian>(ack_id)?;
        }
        Ok(out)
    }

    /// Decode header and return remaining payload.
    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let (header, rest) = Self::decode_inner(data).map_err(ExchangeError::from_io)?;
        if header.version != Self::VERSION_V1 {
            return Err(ExchangeError::UnsupportedVersion(header.version));
        }
        Ok((header, rest))
    }

    fn decode_inner(data: &[u8]) -> std::io::Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let first = cursor.read_u8()?;
        let flags = ExchangeHeaderFlags::from_bits_truncate(first & 0x0f);
        let message_type = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let profile_id = cursor.read_u32::<LittleEndian>()?;
        let ack_id = if flags.contains(ExchangeHeaderFlags::ACK_ID) {
            Some(cursor.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                version: first >> 4,
                flags,
                message_type,
                exchange_id,
                profile_id,
                ack_id,
            },
            rest,
        ))
    }
}

/// Message layer header used by the UDP message layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: MessageVersion,
    pub encryption_type: u8,
    pub key_id: u16,
    pub message_id: u32,
    pub source_node_id: Option<u64>,
    pub dest_node_id: Option<u64>,
}

impl MessageHeader {
    const FLAG_DEST_PRESENT: u8 = 1;
    const FLAG_SRC_PRESENT: u8 = 4;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.is_some() {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        if self.dest_node_id.is_some() {
            flags |= Self::FLAG_DEST_PRESENT;
        }
        let mut out = Vec::with_capacity(24);
        out.write_u8((self.version.as_u8() << 4) | flags)?;
        out.write_u8(self.encryption_type)?;
        out.write_u16::<LittleEndian>(self.key_id)?;
        out.write_u32::<LittleEndian>(self.message_id)?;
        if let Some(sn) = self.source_node_id {
            out.write_u64::<LittleEndian>(sn)?;
        }
        if let Some(dn) = self.dest_node_id {
            out.write_u64::<LittleEndian>(dn)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let first = cursor.read_u8().map_err(ExchangeError::from_io)?;
        let version = MessageVersion::from_u8(first >> 4)?;
        let flags = first & 0x0f;
        let mut read = || -> std::io::Result<(u8, u16, u32, Option<u64>, Option<u64>, Vec<u8>)> {
            let encryption_type = cursor.read_u8()?;
            let key_id = cursor.read_u16::<LittleEndian>()?;
            let message_id = cursor.read_u32::<LittleEndian>()?;
            let source_node_id = if (flags & Self::FLAG_SRC_PRESENT) != 0 {
                Some(cursor.read_u64::<LittleEndian>()?)
            } else {
                None
            };
            let dest_node_id = if (flags & Self::FLAG_DEST_PRESENT) != 0 {
                Some(cursor.read_u64::<LittleEndian>()?)
            } else {
                None
            };
            let mut rest = Vec::new();
            cursor.read_to_end(&mut rest)?;
            Ok((encryption_type, key_id, message_id, source_node_id, dest_node_id, rest))
        };
        let (encryption_type, key_id, message_id, source_node_id, dest_node_id, rest) =
            read().map_err(ExchangeError::from_io)?;
        Ok((
            Self {
                version,
                encryption_type,
                key_id,
                message_id,
                source_node_id,
                dest_node_id,
            },
            rest,
        ))
    }

    pub fn to_message_info(&self, peer_addr: Option<SocketAddr>) -> MessageInfo {
        MessageInfo {
            message_id: self.message_id,
            source_node_id: self.source_node_id.unwrap_or(ANY_NODE_ID),
            dest_node_id: self.dest_node_id.unwrap_or(ANY_NODE_ID),
            flags: MessageFlags::empty(),
            version: self.version,
            key_id: self.key_id,
            encryption_type: self.encryption_type,
            peer_addr,
        }
    }
}

/// Payload of the RMP Throttle-Flow message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleFlow {
    pub pause_time_ms: u32,
}

impl ThrottleFlow {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4);
        out.write_u32::<LittleEndian>(self.pause_time_ms)?;
        Ok(out)
    }
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let pause_time_ms = cursor
            .read_u32::<LittleEndian>()
            .map_err(ExchangeError::from_io)?;
        Ok(Self { pause_time_ms })
    }
}

/// Payload of the RMP Delayed-Delivery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedDelivery {
    pub pause_time_ms: u32,
    pub delayed_node_id: u64,
}

impl DelayedDelivery {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(12);
        out.write_u32::<LittleEndian>(self.pause_time_ms)?;
        out.write_u64::<LittleEndian>(self.delayed_node_id)?;
        Ok(out)
    }
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut read = || -> std::io::Result<Self> {
            Ok(Self {
                pause_time_ms: cursor.read_u32::<LittleEndian>()?,
                delayed_node_id: cursor.read_u64::<LittleEndian>()?,
            })
        };
        read().map_err(ExchangeError::from_io)
    }
}

/// True for Common profile messages consumed by the exchange layer itself.
pub fn is_control_message(profile_id: u32, message_type: u8) -> bool {
    profile_id == PROFILE_COMMON
        && matches!(
            message_type,
            MSG_TYPE_NULL | MSG_TYPE_RMP_THROTTLE_FLOW | MSG_TYPE_RMP_DELAYED_DELIVERY
        )
}

/// Exchange header of a standalone acknowledgment.
pub fn standalone_ack(exchange_id: u16, initiator: bool, ack_id: u32) -> ExchangeHeader {
    let mut header = ExchangeHeader::new(exchange_id, PROFILE_COMMON, MSG_TYPE_NULL);
    if initiator {
        header.flags |= ExchangeHeaderFlags::INITIATOR;
    }
    header.ack_id = Some(ack_id);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_header_wire_layout() {
        let mut h = ExchangeHeader::new(0x1234, 5, 0x20);
        h.flags |= ExchangeHeaderFlags::INITIATOR;
        h.ack_id = Some(42);
        let enc = h.encode().unwrap();
        assert_eq!(hex::encode(&enc), "13203412050000002a000000");

        let mut buf = enc.clone();
        buf.extend_from_slice(&[0xaa, 0xbb]);
        let (d, rest) = ExchangeHeader::decode(&buf).unwrap();
        assert_eq!(d.exchange_id, 0x1234);
        assert_eq!(d.profile_id, 5);
        assert_eq!(d.message_type, 0x20);
        assert!(d.is_initiator());
        assert!(d.flags.contains(ExchangeHeaderFlags::ACK_ID));
        assert_eq!(d.ack_id, Some(42));
        assert_eq!(rest, vec![0xaa, 0xbb]);
    }

    #[test]
    fn exchange_header_without_ack() {
        let mut h = ExchangeHeader::new(7, PROFILE_COMMON, MSG_TYPE_NULL);
        h.flags |= ExchangeHeaderFlags::NEEDS_ACK | ExchangeHeaderFlags::ACK_ID;
        let enc = h.encode().unwrap();
        // ack id flag is dropped when there is no ack id to carry
        assert_eq!(enc.len(), 8);
        let (d, rest) = ExchangeHeader::decode(&enc).unwrap();
        assert!(d.needs_ack());
        assert!(!d.is_initiator());
        assert_eq!(d.ack_id, None);
        assert!(rest.is_empty());
    }

    #[test]
    fn exchange_header_truncated() {
        let e = ExchangeHeader::decode(&hex::decode("1320341205").unwrap()).unwrap_err();
        assert!(matches!(e, ExchangeError::MessageIncomplete));
        // ack flag set but ack id missing
        let e = ExchangeHeader::decode(&hex::decode("1320341205000000").unwrap()).unwrap_err();
        assert!(matches!(e, ExchangeError::MessageIncomplete));
        let e = ExchangeHeader::decode(&hex::decode("2120341205000000").unwrap()).unwrap_err();
        assert!(matches!(e, ExchangeError::UnsupportedVersion(2)));
    }

    #[test]
    fn message_header_wire_layout() {
        let h = MessageHeader {
            version: MessageVersion::V2,
            encryption_type: 0,
            key_id: 0,
            message_id: 7,
            source_node_id: Some(0x1122334455667788),
            dest_node_id: None,
        };
        let mut enc = h.encode().unwrap();
        assert_eq!(hex::encode(&enc), "24000000070000008877665544332211");
        enc.push(0x55);
        let (d, rest) = MessageHeader::decode(&enc).unwrap();
        assert_eq!(d, h);
        assert_eq!(rest, vec![0x55]);

        let info = d.to_message_info(None);
        assert_eq!(info.source_node_id, 0x1122334455667788);
        assert_eq!(info.dest_node_id, ANY_NODE_ID);
        assert_eq!(info.version, MessageVersion::V2);
    }

    #[test]
    fn control_payloads() {
        let t = ThrottleFlow::parse(&hex::decode("e8030000").unwrap()).unwrap();
        assert_eq!(t.pause_time_ms, 1000);
        assert!(ThrottleFlow::parse(&[1, 2]).is_err());

        let dd = DelayedDelivery {
            pause_time_ms: 500,
            delayed_node_id: 0x42,
        };
        let enc = dd.encode().unwrap();
        assert_eq!(enc.len(), 12);
        assert_eq!(DelayedDelivery::parse(&enc).unwrap(), dd);

        assert!(is_control_message(PROFILE_COMMON, MSG_TYPE_NULL));
        assert!(!is_control_message(1, MSG_TYPE_NULL));
        assert!(!is_control_message(PROFILE_COMMON, 1));
    }
}
