//! ChannelData framing (RFC 8656 section 12).
//!
//! Once a channel is bound, relayed data travels as a 4-byte header plus
//! payload instead of full STUN-encapsulated Send/Data indications:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Channel Number        |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Application Data                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Channel numbers live in 0x4000..=0x7FFF, which keeps the first two bits
//! of a ChannelData message distinct from STUN's 0b00 prefix; that is what
//! lets the session demultiplexer tell the two apart.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use rnat_stun_core::CodecError;

/// Lowest valid channel number.
pub const CHANNEL_MIN: u16 = 0x4000;
/// Highest valid channel number.
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// One ChannelData message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Bound channel number (0x4000..=0x7FFF).
    pub number: u16,
    /// Application payload.
    pub data: Bytes,
}

impl ChannelData {
    /// Create a ChannelData message.
    pub fn new(number: u16, data: Bytes) -> Self {
        ChannelData { number, data }
    }

    /// Encode for a datagram transport (no padding).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u16(self.number);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Encode for a stream transport: padded to a 4-byte boundary.
    pub fn encode_padded(&self) -> Bytes {
        let padding = (4 - (self.data.len() % 4)) % 4;
        let mut buf = BytesMut::with_capacity(4 + self.data.len() + padding);
        buf.put_u16(self.number);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        for _ in 0..padding {
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Decode a ChannelData message. Trailing padding is tolerated.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::TruncatedBuffer {
                needed: 4,
                actual: buf.len(),
            });
        }
        let number = BigEndian::read_u16(&buf[0..2]);
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&number) {
            return Err(CodecError::BadAttribute {
                what: "channel number",
                details: format!("0x{number:04x} out of range"),
            });
        }
        let length = BigEndian::read_u16(&buf[2..4]) as usize;
        if buf.len() < 4 + length {
            return Err(CodecError::TruncatedBuffer {
                needed: 4 + length,
                actual: buf.len(),
            });
        }
        Ok(ChannelData {
            number,
            data: Bytes::copy_from_slice(&buf[4..4 + length]),
        })
    }
}

/// Whether a buffer starts like a ChannelData message (first two bits 0b01).
pub fn is_channel_data(buf: &[u8]) -> bool {
    buf.len() >= 4 && (buf[0] & 0xC0) == 0x40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = ChannelData::new(0x4001, Bytes::from_static(b"hello"));
        let wire = msg.encode();
        assert_eq!(wire.len(), 9);
        assert_eq!(ChannelData::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn padded_encoding_still_decodes() {
        let msg = ChannelData::new(0x7fff, Bytes::from_static(b"abc"));
        let wire = msg.encode_padded();
        assert_eq!(wire.len() % 4, 0);
        assert_eq!(ChannelData::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn rejects_out_of_range_channel() {
        let wire = [0x3f, 0xff, 0x00, 0x00];
        assert!(ChannelData::decode(&wire).is_err());
        let wire = [0x80, 0x00, 0x00, 0x00];
        assert!(ChannelData::decode(&wire).is_err());
    }

    #[test]
    fn rejects_short_payload() {
        let wire = [0x40, 0x00, 0x00, 0x10, 0xaa];
        assert!(matches!(
            ChannelData::decode(&wire),
            Err(CodecError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn discriminator() {
        assert!(is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x00, 0x01, 0x00, 0x00]));
        assert!(!is_channel_data(&[0xc0, 0x00, 0x00, 0x00]));
    }
}
