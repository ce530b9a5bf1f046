//! STUN attributes: typed constructors and accessors over raw TLV values.
//!
//! Attributes are stored as raw bytes with a typed tag. Typed access goes
//! through the `as_*` accessors, which validate shape on the way out. XOR
//! address masking (RFC 8489 section 14.2) is shared by the mapped, peer and
//! relayed address attributes.

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{TransactionId, MAGIC_COOKIE};

/// STUN attribute types used by this stack (RFC 8489, RFC 8656, RFC 8445).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunAttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedTransport,
    DontFragment,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Software,
    AlternateServer,
    Fingerprint,
    IceControlled,
    IceControlling,
    /// Attribute type this stack does not model. Kept opaque when in the
    /// comprehension-optional range.
    Other(u16),
}

impl From<u16> for StunAttributeType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8023 => Self::AlternateServer,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Other(other),
        }
    }
}

impl From<StunAttributeType> for u16 {
    fn from(attr_type: StunAttributeType) -> Self {
        match attr_type {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::Username => 0x0006,
            StunAttributeType::MessageIntegrity => 0x0008,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::UnknownAttributes => 0x000A,
            StunAttributeType::ChannelNumber => 0x000C,
            StunAttributeType::Lifetime => 0x000D,
            StunAttributeType::XorPeerAddress => 0x0012,
            StunAttributeType::Data => 0x0013,
            StunAttributeType::Realm => 0x0014,
            StunAttributeType::Nonce => 0x0015,
            StunAttributeType::XorRelayedAddress => 0x0016,
            StunAttributeType::RequestedTransport => 0x0019,
            StunAttributeType::DontFragment => 0x001A,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Priority => 0x0024,
            StunAttributeType::UseCandidate => 0x0025,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::AlternateServer => 0x8023,
            StunAttributeType::Fingerprint => 0x8028,
            StunAttributeType::IceControlled => 0x8029,
            StunAttributeType::IceControlling => 0x802A,
            StunAttributeType::Other(value) => value,
        }
    }
}

impl StunAttributeType {
    /// Whether a decoder that does not understand this type must reject the
    /// message (types below 0x8000 are comprehension-required).
    pub fn comprehension_required(raw: u16) -> bool {
        raw < 0x8000
    }
}

/// One STUN attribute: typed tag plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    /// Attribute type.
    pub attr_type: StunAttributeType,
    /// Attribute value, without padding.
    pub value: Bytes,
}

impl StunAttribute {
    /// Create a new attribute from raw bytes.
    pub fn new(attr_type: StunAttributeType, value: Bytes) -> Self {
        Self { attr_type, value }
    }

    // --- address attributes ---

    /// Create a MAPPED-ADDRESS attribute (no XOR masking).
    pub fn mapped_address(addr: SocketAddr) -> Self {
        Self::new(
            StunAttributeType::MappedAddress,
            encode_address(addr, None),
        )
    }

    /// Create a XOR-MAPPED-ADDRESS attribute.
    pub fn xor_mapped_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::new(
            StunAttributeType::XorMappedAddress,
            encode_address(addr, Some(transaction_id)),
        )
    }

    /// Create a XOR-PEER-ADDRESS attribute (TURN).
    pub fn xor_peer_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::new(
            StunAttributeType::XorPeerAddress,
            encode_address(addr, Some(transaction_id)),
        )
    }

    /// Create a XOR-RELAYED-ADDRESS attribute (TURN).
    pub fn xor_relayed_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::new(
            StunAttributeType::XorRelayedAddress,
            encode_address(addr, Some(transaction_id)),
        )
    }

    /// Decode an XOR-masked address attribute value.
    pub fn as_xor_address(&self, transaction_id: &TransactionId) -> Result<SocketAddr, CodecError> {
        decode_address(&self.value, Some(transaction_id))
    }

    /// Decode a plain (unmasked) address attribute value.
    pub fn as_plain_address(&self) -> Result<SocketAddr, CodecError> {
        decode_address(&self.value, None)
    }

    // --- text attributes ---

    /// Create a USERNAME attribute.
    pub fn username(username: &str) -> Self {
        Self::new(
            StunAttributeType::Username,
            Bytes::copy_from_slice(username.as_bytes()),
        )
    }

    /// Create a REALM attribute.
    pub fn realm(realm: &str) -> Self {
        Self::new(
            StunAttributeType::Realm,
            Bytes::copy_from_slice(realm.as_bytes()),
        )
    }

    /// Create a NONCE attribute.
    pub fn nonce(nonce: &[u8]) -> Self {
        Self::new(StunAttributeType::Nonce, Bytes::copy_from_slice(nonce))
    }

    /// Create a SOFTWARE attribute.
    pub fn software(software: &str) -> Self {
        Self::new(
            StunAttributeType::Software,
            Bytes::copy_from_slice(software.as_bytes()),
        )
    }

    /// Interpret the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.value).map_err(|_| CodecError::BadAttribute {
            what: "text",
            details: "invalid utf-8".to_string(),
        })
    }

    // --- numeric attributes ---

    /// Create a PRIORITY attribute (ICE).
    pub fn priority(priority: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(priority);
        Self::new(StunAttributeType::Priority, value.freeze())
    }

    /// Create a LIFETIME attribute (TURN), in seconds.
    pub fn lifetime(seconds: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(seconds);
        Self::new(StunAttributeType::Lifetime, value.freeze())
    }

    /// Create a USE-CANDIDATE attribute (ICE, zero length).
    pub fn use_candidate() -> Self {
        Self::new(StunAttributeType::UseCandidate, Bytes::new())
    }

    /// Create an ICE-CONTROLLING attribute with the agent tie-breaker.
    pub fn ice_controlling(tiebreaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tiebreaker);
        Self::new(StunAttributeType::IceControlling, value.freeze())
    }

    /// Create an ICE-CONTROLLED attribute with the agent tie-breaker.
    pub fn ice_controlled(tiebreaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tiebreaker);
        Self::new(StunAttributeType::IceControlled, value.freeze())
    }

    /// Create a REQUESTED-TRANSPORT attribute for UDP (protocol 17).
    pub fn requested_transport_udp() -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u8(17);
        value.put_u8(0);
        value.put_u16(0);
        Self::new(StunAttributeType::RequestedTransport, value.freeze())
    }

    /// Create a CHANNEL-NUMBER attribute (TURN).
    pub fn channel_number(number: u16) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u16(number);
        value.put_u16(0);
        Self::new(StunAttributeType::ChannelNumber, value.freeze())
    }

    /// Create a DATA attribute (TURN).
    pub fn data(data: Bytes) -> Self {
        Self::new(StunAttributeType::Data, data)
    }

    /// Interpret the value as a big-endian u32.
    pub fn as_u32(&self) -> Result<u32, CodecError> {
        if self.value.len() != 4 {
            return Err(CodecError::BadAttribute {
                what: "u32",
                details: format!("length {}", self.value.len()),
            });
        }
        Ok(u32::from_be_bytes([
            self.value[0],
            self.value[1],
            self.value[2],
            self.value[3],
        ]))
    }

    /// Interpret the value as a big-endian u64 (tie-breakers).
    pub fn as_u64(&self) -> Result<u64, CodecError> {
        if self.value.len() != 8 {
            return Err(CodecError::BadAttribute {
                what: "u64",
                details: format!("length {}", self.value.len()),
            });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.value);
        Ok(u64::from_be_bytes(buf))
    }

    /// Interpret the value as a CHANNEL-NUMBER (upper 16 bits).
    pub fn as_channel_number(&self) -> Result<u16, CodecError> {
        if self.value.len() != 4 {
            return Err(CodecError::BadAttribute {
                what: "channel number",
                details: format!("length {}", self.value.len()),
            });
        }
        Ok(u16::from_be_bytes([self.value[0], self.value[1]]))
    }

    // --- error code ---

    /// Create an ERROR-CODE attribute from a three-digit code and reason.
    pub fn error_code(code: u16, reason: &str) -> Self {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        Self::new(StunAttributeType::ErrorCode, value.freeze())
    }

    /// Decode an ERROR-CODE attribute into (code, reason).
    pub fn as_error_code(&self) -> Result<(u16, String), CodecError> {
        if self.value.len() < 4 {
            return Err(CodecError::BadAttribute {
                what: "error code",
                details: format!("length {}", self.value.len()),
            });
        }
        let class = (self.value[2] & 0x07) as u16;
        let number = self.value[3] as u16;
        let code = class * 100 + number;
        let reason = String::from_utf8_lossy(&self.value[4..]).into_owned();
        Ok((code, reason))
    }

    /// Create an UNKNOWN-ATTRIBUTES attribute listing the offending types.
    pub fn unknown_attributes(types: &[u16]) -> Self {
        let mut value = BytesMut::with_capacity(types.len() * 2);
        for t in types {
            value.put_u16(*t);
        }
        Self::new(StunAttributeType::UnknownAttributes, value.freeze())
    }
}

/// Encode a socket address, XOR-masked when a transaction id is supplied.
fn encode_address(addr: SocketAddr, transaction_id: Option<&TransactionId>) -> Bytes {
    let mut value = BytesMut::with_capacity(20);

    value.put_u8(0);
    let family = match addr.ip() {
        IpAddr::V4(_) => 1u8,
        IpAddr::V6(_) => 2u8,
    };
    value.put_u8(family);

    let port = match transaction_id {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    value.put_u16(port);

    match addr.ip() {
        IpAddr::V4(ipv4) => {
            let mut ip = u32::from_be_bytes(ipv4.octets());
            if transaction_id.is_some() {
                ip ^= MAGIC_COOKIE;
            }
            value.put_u32(ip);
        }
        IpAddr::V6(ipv6) => {
            let mut octets = ipv6.octets();
            if let Some(tid) = transaction_id {
                // XOR with magic cookie then transaction id (RFC 8489 14.2).
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
                for i in 0..12 {
                    octets[i + 4] ^= tid.as_bytes()[i];
                }
            }
            value.put_slice(&octets);
        }
    }

    value.freeze()
}

/// Decode a socket address, un-XORing when a transaction id is supplied.
fn decode_address(
    value: &Bytes,
    transaction_id: Option<&TransactionId>,
) -> Result<SocketAddr, CodecError> {
    if value.len() < 8 {
        return Err(CodecError::BadAttribute {
            what: "address",
            details: format!("length {}", value.len()),
        });
    }

    let mut buf = value.clone();
    buf.advance(1);
    let family = buf.get_u8();
    let raw_port = buf.get_u16();
    let port = match transaction_id {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };

    let ip = match family {
        1 => {
            let mut ip = buf.get_u32();
            if transaction_id.is_some() {
                ip ^= MAGIC_COOKIE;
            }
            IpAddr::from(ip.to_be_bytes())
        }
        2 => {
            if buf.remaining() < 16 {
                return Err(CodecError::BadAttribute {
                    what: "address",
                    details: format!("IPv6 length {}", value.len()),
                });
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            if let Some(tid) = transaction_id {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
                for i in 0..12 {
                    octets[i + 4] ^= tid.as_bytes()[i];
                }
            }
            IpAddr::from(octets)
        }
        other => {
            return Err(CodecError::BadAttribute {
                what: "address",
                details: format!("unsupported family {other}"),
            })
        }
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TransactionId {
        TransactionId::from_bytes([
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ])
    }

    #[test]
    fn xor_mapped_address_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let tid = tid();
        let attr = StunAttribute::xor_mapped_address(addr, &tid);
        assert_eq!(attr.as_xor_address(&tid).unwrap(), addr);
    }

    #[test]
    fn xor_mapped_address_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();
        let tid = tid();
        let attr = StunAttribute::xor_mapped_address(addr, &tid);
        assert_eq!(attr.as_xor_address(&tid).unwrap(), addr);
    }

    #[test]
    fn rfc5769_xor_mapped_address_value() {
        // RFC 5769 section 2.2: 192.0.2.1:32853 under that transaction id.
        let tid = tid();
        let attr = StunAttribute::xor_mapped_address("192.0.2.1:32853".parse().unwrap(), &tid);
        assert_eq!(
            attr.value.as_ref(),
            &[0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]
        );
    }

    #[test]
    fn error_code_round_trip() {
        let attr = StunAttribute::error_code(438, "Stale Nonce");
        assert_eq!(attr.as_error_code().unwrap(), (438, "Stale Nonce".to_string()));
    }

    #[test]
    fn plain_mapped_address() {
        let addr: SocketAddr = "10.0.0.7:4242".parse().unwrap();
        let attr = StunAttribute::mapped_address(addr);
        assert_eq!(attr.as_plain_address().unwrap(), addr);
    }

    #[test]
    fn bad_address_family_rejected() {
        let attr = StunAttribute::new(
            StunAttributeType::XorMappedAddress,
            Bytes::from_static(&[0, 9, 0, 0, 0, 0, 0, 0]),
        );
        assert!(attr.as_xor_address(&tid()).is_err());
    }
}
