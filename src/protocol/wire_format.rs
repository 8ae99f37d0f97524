//! Wire format encoding and decoding.
//!
//! Implements the 6-byte MBAP-style header:
//! ```text
//! ┌──────────────┬─────────────┬──────────┐
//! │ Transaction  │ Protocol ID │ Length   │
//! │ 2 bytes      │ 2 bytes     │ 2 bytes  │
//! │ uint16 BE    │ uint16 BE   │ uint16 BE│
//! └──────────────┴─────────────┴──────────┘
//! ```
//!
//! The length counts the payload bytes that follow the header. For protocol
//! id 0 the payload is unit id ‖ function code ‖ data.

use crate::error::{MbapError, Result};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Protocol identifier of the protocol proper.
pub const MODBUS_PROTOCOL_ID: u16 = 0x0000;

/// Maximum payload of any frame (the length field is 16 bits).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Maximum payload of a protocol-0 frame: unit id + function code + 252 data bytes.
pub const MAX_PDU_PAYLOAD_SIZE: usize = 254;

/// Minimum payload of a protocol-0 frame: unit id + function code.
pub const MIN_PDU_PAYLOAD_SIZE: usize = 2;

/// Maximum data bytes carried after the unit id and function code.
pub const MAX_PDU_DATA_SIZE: usize = MAX_PDU_PAYLOAD_SIZE - MIN_PDU_PAYLOAD_SIZE;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Transaction identifier correlating a request with its response.
    pub transaction_id: u16,
    /// Protocol identifier (0 = the protocol proper).
    pub protocol_id: u16,
    /// Payload length in bytes.
    pub payload_length: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(transaction_id: u16, protocol_id: u16, payload_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use mbap_transport::protocol::Header;
    ///
    /// let header = Header::new(1, 0, 6);
    /// assert_eq!(header.encode(), [0x00, 0x01, 0x00, 0x00, 0x00, 0x06]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (6 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            payload_length: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }

    /// Check if this header belongs to the protocol proper.
    #[inline]
    pub fn is_modbus(&self) -> bool {
        self.protocol_id == MODBUS_PROTOCOL_ID
    }

    /// Check whether the declared length is acceptable for the protocol id.
    ///
    /// Protocol-0 frames may carry at most 254 payload bytes; other protocol
    /// ids are bounded only by the 16-bit length field.
    #[inline]
    pub fn has_valid_length(&self) -> bool {
        !self.is_modbus() || self.payload_length as usize <= MAX_PDU_PAYLOAD_SIZE
    }
}

/// Validate a payload length against the limits for `protocol_id`.
pub fn validate_payload_len(protocol_id: u16, len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(MbapError::Parameter(format!(
            "Payload size {} exceeds maximum {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    if protocol_id == MODBUS_PROTOCOL_ID && len > MAX_PDU_PAYLOAD_SIZE {
        return Err(MbapError::Parameter(format!(
            "Payload size {} exceeds protocol maximum {}",
            len, MAX_PDU_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(0xBEEF, 0, 254);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x0102, 0x0304, 0x0506).encode();
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_valid_length_depends_on_protocol() {
        assert!(Header::new(1, 0, 254).has_valid_length());
        assert!(!Header::new(1, 0, 255).has_valid_length());
        assert!(Header::new(1, 7, 255).has_valid_length());
        assert!(Header::new(1, 7, u16::MAX).has_valid_length());
    }

    #[test]
    fn test_validate_payload_len() {
        assert!(validate_payload_len(0, 254).is_ok());
        assert!(validate_payload_len(0, 255).is_err());
        assert!(validate_payload_len(1, 65535).is_ok());
        assert!(validate_payload_len(1, 65536).is_err());
    }
}
