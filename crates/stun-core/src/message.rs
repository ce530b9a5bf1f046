//! STUN message codec (RFC 5389 / RFC 8489).
//!
//! A [`StunMessage`] is a class + method + 96-bit transaction id plus an
//! ordered attribute list. Encoding is infallible; MESSAGE-INTEGRITY and
//! FINGERPRINT are computed during encode (never taken from the attribute
//! list) so a message is immutable once encoded. Decoding validates the
//! header, attribute bounds, attribute ordering around MESSAGE-INTEGRITY,
//! and the FINGERPRINT checksum; MESSAGE-INTEGRITY verification is deferred
//! to [`verify_integrity`] because only the caller knows the key.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;

use crate::attr::{StunAttribute, StunAttributeType};
use crate::error::{CodecError, StunError};

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN message header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// XOR mask applied to the FINGERPRINT CRC ("sTUN" in ASCII).
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// 96-bit STUN transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a cryptographically random transaction id.
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill(&mut id);
        TransactionId(id)
    }

    /// Build from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// STUN message class (the two C bits of the message type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn to_bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Whether this class is a response to a request.
    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN methods used by this stack (RFC 8489 and RFC 8656).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Other(u16),
}

impl Method {
    fn to_bits(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
            Self::Other(m) => m & 0x0FFF,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0x001 => Self::Binding,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Other(other),
        }
    }
}

/// Pack class and method into the 14-bit message type.
///
/// Layout (RFC 5389 section 6):
/// `|M11..M7|C1|M6..M4|C0|M3..M0|`
fn message_type(class: MessageClass, method: Method) -> u16 {
    let m = method.to_bits();
    let c = class.to_bits();
    ((m & 0x0F80) << 2) | ((m & 0x0070) << 1) | (m & 0x000F) | ((c & 0x2) << 7) | ((c & 0x1) << 4)
}

fn split_message_type(typ: u16) -> (MessageClass, Method) {
    let c = ((typ >> 7) & 0x2) | ((typ >> 4) & 0x1);
    let m = ((typ >> 2) & 0x0F80) | ((typ >> 1) & 0x0070) | (typ & 0x000F);
    (MessageClass::from_bits(c), Method::from_bits(m))
}

/// Quick check that a buffer could be a STUN message: leading two bits zero
/// and magic cookie in place. Used by demultiplexers before attempting a
/// full decode.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE
        && (buf[0] & 0xC0) == 0
        && BigEndian::read_u32(&buf[4..8]) == MAGIC_COOKIE
}

/// For stream transports: the total frame length (header included) declared
/// by a STUN header, once at least 4 bytes are buffered.
pub fn stream_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some(HEADER_SIZE + BigEndian::read_u16(&buf[2..4]) as usize)
}

/// Decode options. The defaults verify everything verifiable without a key.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Verify FINGERPRINT when present. Disable only when decoding messages
    /// addressed to other entities (relay/demux scenarios).
    pub check_fingerprint: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            check_fingerprint: true,
        }
    }
}

/// A STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message class.
    pub class: MessageClass,
    /// Message method.
    pub method: Method,
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Ordered attribute list. MESSAGE-INTEGRITY and FINGERPRINT appear here
    /// after a decode but are recomputed (not copied) on encode.
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a message with a fresh random transaction id.
    pub fn new(class: MessageClass, method: Method) -> Self {
        StunMessage {
            class,
            method,
            transaction_id: TransactionId::random(),
            attributes: Vec::new(),
        }
    }

    /// Create a Binding request.
    pub fn binding_request() -> Self {
        Self::new(MessageClass::Request, Method::Binding)
    }

    /// Create a request for the given method.
    pub fn request(method: Method) -> Self {
        Self::new(MessageClass::Request, method)
    }

    /// Create an indication for the given method.
    pub fn indication(method: Method) -> Self {
        Self::new(MessageClass::Indication, method)
    }

    /// Create a success response matching a request's method and id.
    pub fn success_response(request: &StunMessage) -> Self {
        StunMessage {
            class: MessageClass::SuccessResponse,
            method: request.method,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create an error response matching a request, carrying ERROR-CODE.
    pub fn error_response(request: &StunMessage, code: u16, reason: &str) -> Self {
        let mut msg = StunMessage {
            class: MessageClass::ErrorResponse,
            method: request.method,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        };
        msg.add_attribute(StunAttribute::error_code(code, reason));
        msg
    }

    /// Append an attribute.
    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    /// Find an attribute by type.
    pub fn get_attribute(&self, attr_type: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.attr_type == attr_type)
    }

    /// The ERROR-CODE of an error-class response, if present and well formed.
    pub fn error_code(&self) -> Option<(u16, String)> {
        self.get_attribute(StunAttributeType::ErrorCode)
            .and_then(|attr| attr.as_error_code().ok())
    }

    /// Encode without MESSAGE-INTEGRITY or FINGERPRINT.
    pub fn encode(&self) -> Bytes {
        self.encode_with(None, false)
    }

    /// Encode, appending MESSAGE-INTEGRITY (when `key` is given) and then
    /// FINGERPRINT (when `fingerprint` is set), in that mandatory order.
    ///
    /// Any MESSAGE-INTEGRITY or FINGERPRINT already present in the attribute
    /// list (for example from a previous decode) is skipped and recomputed.
    pub fn encode_with(&self, key: Option<&[u8]>, fingerprint: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128);

        buf.put_u16(message_type(self.class, self.method));
        buf.put_u16(0); // length, patched below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if matches!(
                attr.attr_type,
                StunAttributeType::MessageIntegrity | StunAttributeType::Fingerprint
            ) {
                continue;
            }
            let attr_type: u16 = attr.attr_type.into();
            buf.put_u16(attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            let padding = (4 - (attr.value.len() % 4)) % 4;
            for _ in 0..padding {
                buf.put_u8(0);
            }
        }

        if let Some(key) = key {
            // Header length covers up to and including MESSAGE-INTEGRITY
            // while the HMAC input stops just before it (RFC 8489 14.5).
            let integrity_offset = buf.len();
            patch_length(&mut buf, integrity_offset - HEADER_SIZE + 24);
            let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(&buf);
            let digest = mac.finalize().into_bytes();
            buf.put_u16(StunAttributeType::MessageIntegrity.into());
            buf.put_u16(20);
            buf.put_slice(&digest);
        }

        if fingerprint {
            let fp_offset = buf.len();
            patch_length(&mut buf, fp_offset - HEADER_SIZE + 8);
            let crc = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(StunAttributeType::Fingerprint.into());
            buf.put_u16(4);
            buf.put_u32(crc);
        }

        let total = buf.len();
        patch_length(&mut buf, total - HEADER_SIZE);
        buf.freeze()
    }

    /// Decode a datagram with default options.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        Self::decode_with(buf, DecodeOptions::default())
    }

    /// Decode a datagram.
    ///
    /// Validates the header, that the declared length matches the buffer,
    /// attribute bounds, comprehension-required coverage, the position of
    /// MESSAGE-INTEGRITY/FINGERPRINT, and (unless disabled) the FINGERPRINT
    /// checksum. Padding bytes are skipped but not required to be zero.
    pub fn decode_with(buf: &[u8], options: DecodeOptions) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::TruncatedBuffer {
                needed: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[0] & 0xC0 != 0 {
            return Err(CodecError::NotStun);
        }

        let (class, method) = split_message_type(BigEndian::read_u16(&buf[0..2]));
        let declared = BigEndian::read_u16(&buf[2..4]) as usize;
        if declared % 4 != 0 {
            return Err(CodecError::UnalignedLength(declared));
        }

        let cookie = BigEndian::read_u32(&buf[4..8]);
        if cookie != MAGIC_COOKIE {
            return Err(CodecError::BadMagicCookie(cookie));
        }

        if buf.len() != HEADER_SIZE + declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: buf.len() - HEADER_SIZE,
            });
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        let end = HEADER_SIZE + declared;
        let mut integrity_seen = false;

        while offset < end {
            if offset + 4 > end {
                return Err(CodecError::TruncatedBuffer {
                    needed: offset + 4,
                    actual: end,
                });
            }
            let raw_type = BigEndian::read_u16(&buf[offset..offset + 2]);
            let attr_len = BigEndian::read_u16(&buf[offset + 2..offset + 4]) as usize;
            let value_offset = offset + 4;

            if value_offset + attr_len > end {
                return Err(CodecError::AttributeOverrun {
                    attr_type: raw_type,
                    declared: attr_len,
                    remaining: end - value_offset,
                });
            }

            let attr_type = StunAttributeType::from(raw_type);
            if matches!(attr_type, StunAttributeType::Other(_))
                && StunAttributeType::comprehension_required(raw_type)
            {
                return Err(CodecError::UnknownRequiredAttribute(raw_type));
            }

            // Only FINGERPRINT may follow MESSAGE-INTEGRITY.
            if integrity_seen && attr_type != StunAttributeType::Fingerprint {
                return Err(CodecError::AttributeAfterIntegrity(raw_type));
            }

            match attr_type {
                StunAttributeType::MessageIntegrity => integrity_seen = true,
                StunAttributeType::Fingerprint => {
                    if value_offset + attr_len != end {
                        return Err(CodecError::BadAttribute {
                            what: "FINGERPRINT",
                            details: "not the last attribute".to_string(),
                        });
                    }
                    if options.check_fingerprint {
                        verify_fingerprint(buf, offset, &buf[value_offset..value_offset + attr_len])?;
                    }
                }
                _ => {}
            }

            attributes.push(StunAttribute::new(
                attr_type,
                Bytes::copy_from_slice(&buf[value_offset..value_offset + attr_len]),
            ));

            let padding = (4 - (attr_len % 4)) % 4;
            offset = value_offset + attr_len + padding;
        }

        Ok(StunMessage {
            class,
            method,
            transaction_id: TransactionId::from_bytes(transaction_id),
            attributes,
        })
    }
}

fn patch_length(buf: &mut BytesMut, length: usize) {
    BigEndian::write_u16(&mut buf[2..4], length as u16);
}

fn verify_fingerprint(packet: &[u8], fp_offset: usize, value: &[u8]) -> Result<(), CodecError> {
    if value.len() != 4 {
        return Err(CodecError::BadAttribute {
            what: "FINGERPRINT",
            details: format!("length {}", value.len()),
        });
    }
    // CRC over everything preceding the attribute, with the header length
    // as transmitted (it already counts the fingerprint attribute).
    let expected = CRC32.checksum(&packet[..fp_offset]) ^ FINGERPRINT_XOR;
    if expected != BigEndian::read_u32(value) {
        return Err(CodecError::BadFingerprint);
    }
    Ok(())
}

/// Verify MESSAGE-INTEGRITY of a raw packet against `key`.
///
/// Works on the raw datagram because the HMAC input is the wire encoding
/// with the header length patched to stop at the integrity attribute
/// (RFC 8489 section 14.5). Returns `Ok(())` on a match,
/// [`StunError::IntegrityMismatch`] on a failed check, and a codec error
/// when the attribute is missing or the packet is malformed.
pub fn verify_integrity(packet: &[u8], key: &[u8]) -> Result<(), StunError> {
    if packet.len() < HEADER_SIZE {
        return Err(CodecError::TruncatedBuffer {
            needed: HEADER_SIZE,
            actual: packet.len(),
        }
        .into());
    }
    let declared = BigEndian::read_u16(&packet[2..4]) as usize;
    let end = (HEADER_SIZE + declared).min(packet.len());

    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let raw_type = BigEndian::read_u16(&packet[offset..offset + 2]);
        let attr_len = BigEndian::read_u16(&packet[offset + 2..offset + 4]) as usize;
        let value_offset = offset + 4;
        if value_offset + attr_len > end {
            return Err(CodecError::AttributeOverrun {
                attr_type: raw_type,
                declared: attr_len,
                remaining: end - value_offset,
            }
            .into());
        }

        if StunAttributeType::from(raw_type) == StunAttributeType::MessageIntegrity {
            if attr_len != 20 {
                return Err(CodecError::BadAttribute {
                    what: "MESSAGE-INTEGRITY",
                    details: format!("length {attr_len}"),
                }
                .into());
            }
            let mut input = packet[..offset].to_vec();
            BigEndian::write_u16(&mut input[2..4], (offset - HEADER_SIZE + 24) as u16);
            let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(&input);
            return mac
                .verify_slice(&packet[value_offset..value_offset + attr_len])
                .map_err(|_| StunError::IntegrityMismatch);
        }

        let padding = (4 - (attr_len % 4)) % 4;
        offset = value_offset + attr_len + padding;
    }

    Err(CodecError::BadAttribute {
        what: "MESSAGE-INTEGRITY",
        details: "attribute not present".to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::short_term_key;

    /// RFC 5769 section 2.1: sample request with long authentication.
    const RFC5769_REQUEST: &[u8] = &[
        0x00, 0x01, 0x00, 0x58, 0x21, 0x12, 0xa4, 0x42, 0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6,
        0x86, 0xfa, 0x87, 0xdf, 0xae, 0x80, 0x22, 0x00, 0x10, 0x53, 0x54, 0x55, 0x4e, 0x20, 0x74,
        0x65, 0x73, 0x74, 0x20, 0x63, 0x6c, 0x69, 0x65, 0x6e, 0x74, 0x00, 0x24, 0x00, 0x04, 0x6e,
        0x00, 0x01, 0xff, 0x80, 0x29, 0x00, 0x08, 0x93, 0x2f, 0xf9, 0xb1, 0x51, 0x26, 0x3b, 0x36,
        0x00, 0x06, 0x00, 0x09, 0x65, 0x76, 0x74, 0x6a, 0x3a, 0x68, 0x36, 0x76, 0x59, 0x20, 0x20,
        0x20, 0x00, 0x08, 0x00, 0x14, 0x9a, 0xea, 0xa7, 0x0c, 0xbf, 0xd8, 0xcb, 0x56, 0x78, 0x1e,
        0xf2, 0xb5, 0xb2, 0xd3, 0xf2, 0x49, 0xc1, 0xb5, 0x71, 0xa2, 0x80, 0x28, 0x00, 0x04, 0xe5,
        0x7a, 0x3b, 0xcf,
    ];

    #[test]
    fn decodes_rfc5769_sample_request() {
        let msg = StunMessage::decode(RFC5769_REQUEST).unwrap();
        assert_eq!(msg.class, MessageClass::Request);
        assert_eq!(msg.method, Method::Binding);
        let username = msg.get_attribute(StunAttributeType::Username).unwrap();
        assert_eq!(username.as_str().unwrap(), "evtj:h6vY");
        // Non-zero padding (0x20) after USERNAME must be tolerated.
        let priority = msg.get_attribute(StunAttributeType::Priority).unwrap();
        assert_eq!(priority.as_u32().unwrap(), 0x6e0001ff);
    }

    #[test]
    fn verifies_rfc5769_integrity() {
        let key = short_term_key("VOkJxbRl1RmTxUk/WvJxBt");
        verify_integrity(RFC5769_REQUEST, &key).unwrap();
        assert!(matches!(
            verify_integrity(RFC5769_REQUEST, b"wrong"),
            Err(StunError::IntegrityMismatch)
        ));
    }

    #[test]
    fn rejects_corrupted_fingerprint() {
        let mut bad = RFC5769_REQUEST.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert_eq!(
            StunMessage::decode(&bad).unwrap_err(),
            CodecError::BadFingerprint
        );

        // Disabling the check lets relay scenarios decode it anyway.
        let options = DecodeOptions {
            check_fingerprint: false,
        };
        StunMessage::decode_with(&bad, options).unwrap();
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::username("anna:bert"));
        msg.add_attribute(StunAttribute::priority(0x7f00ffff));
        msg.add_attribute(StunAttribute::software("rnat-stun-core"));

        let encoded = msg.encode();
        assert_eq!(encoded.len() % 4, 0);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_with_auth_excludes_computed_attributes() {
        let key = short_term_key("pass");
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::username("anna:bert"));

        let encoded = msg.encode_with(Some(&key), true);
        verify_integrity(&encoded, &key).unwrap();

        let decoded = StunMessage::decode(&encoded).unwrap();
        // Same message modulo the recomputed attributes.
        let plain: Vec<_> = decoded
            .attributes
            .iter()
            .filter(|a| {
                !matches!(
                    a.attr_type,
                    StunAttributeType::MessageIntegrity | StunAttributeType::Fingerprint
                )
            })
            .cloned()
            .collect();
        assert_eq!(plain, msg.attributes);
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let mut bad = StunMessage::binding_request().encode().to_vec();
        bad[4] = 0;
        assert!(matches!(
            StunMessage::decode(&bad),
            Err(CodecError::BadMagicCookie(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 12]),
            Err(CodecError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn rejects_attribute_overrun() {
        let mut msg = StunMessage::binding_request().encode().to_vec();
        // Append an attribute header claiming 64 bytes with none present.
        msg.extend_from_slice(&[0x00, 0x06, 0x00, 0x40]);
        let new_len = (msg.len() - HEADER_SIZE) as u16;
        msg[2..4].copy_from_slice(&new_len.to_be_bytes());
        assert!(matches!(
            StunMessage::decode(&msg),
            Err(CodecError::AttributeOverrun { .. })
        ));
    }

    #[test]
    fn rejects_unknown_comprehension_required_attribute() {
        let mut msg = StunMessage::binding_request().encode().to_vec();
        // 0x7fff is comprehension-required and unknown to this stack.
        msg.extend_from_slice(&[0x7f, 0xff, 0x00, 0x00]);
        let new_len = (msg.len() - HEADER_SIZE) as u16;
        msg[2..4].copy_from_slice(&new_len.to_be_bytes());
        assert_eq!(
            StunMessage::decode(&msg).unwrap_err(),
            CodecError::UnknownRequiredAttribute(0x7fff)
        );
    }

    #[test]
    fn preserves_unknown_optional_attribute() {
        let mut msg = StunMessage::binding_request().encode().to_vec();
        msg.extend_from_slice(&[0xff, 0xff, 0x00, 0x02, 0xab, 0xcd, 0x00, 0x00]);
        let new_len = (msg.len() - HEADER_SIZE) as u16;
        msg[2..4].copy_from_slice(&new_len.to_be_bytes());

        let decoded = StunMessage::decode(&msg).unwrap();
        let attr = decoded
            .get_attribute(StunAttributeType::Other(0xffff))
            .unwrap();
        assert_eq!(attr.value.as_ref(), &[0xab, 0xcd]);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut msg = StunMessage::binding_request().encode().to_vec();
        msg.push(0);
        msg.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            StunMessage::decode(&msg),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn message_type_bit_split() {
        assert_eq!(message_type(MessageClass::Request, Method::Binding), 0x0001);
        assert_eq!(
            message_type(MessageClass::SuccessResponse, Method::Binding),
            0x0101
        );
        assert_eq!(
            message_type(MessageClass::ErrorResponse, Method::Binding),
            0x0111
        );
        assert_eq!(message_type(MessageClass::Request, Method::Allocate), 0x0003);
        assert_eq!(
            message_type(MessageClass::Indication, Method::Send),
            0x0016
        );

        for typ in [0x0001u16, 0x0101, 0x0111, 0x0003, 0x0016, 0x0017] {
            let (class, method) = split_message_type(typ);
            assert_eq!(message_type(class, method), typ);
        }
    }

    #[test]
    fn is_stun_discriminates() {
        let msg = StunMessage::binding_request().encode();
        assert!(is_stun(&msg));
        assert!(!is_stun(b"hello world, not stun at all"));
        // ChannelData starts with 0b01 in the top bits.
        assert!(!is_stun(&[0x40, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn stream_frame_length() {
        let msg = StunMessage::binding_request().encode();
        assert_eq!(stream_frame_len(&msg), Some(msg.len()));
        assert_eq!(stream_frame_len(&msg[..3]), None);
    }
}
