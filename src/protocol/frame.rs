//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame: transaction id, protocol id and
//! payload. Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use mbap_transport::protocol::Frame;
//!
//! let frame = Frame::new(1, 0, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
//! assert_eq!(
//!     frame.to_bytes(),
//!     vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
//! );
//! ```

use bytes::Bytes;

use super::wire_format::{validate_payload_len, Header, HEADER_SIZE, MODBUS_PROTOCOL_ID};
use crate::error::Result;

/// A complete protocol frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    transaction_id: u16,
    protocol_id: u16,
    payload: Bytes,
}

impl Frame {
    /// Create a new frame, validating the payload size for the protocol id.
    pub fn new(transaction_id: u16, protocol_id: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        validate_payload_len(protocol_id, payload.len())?;
        Ok(Self {
            transaction_id,
            protocol_id,
            payload,
        })
    }

    /// Create a protocol-0 frame.
    pub fn modbus(transaction_id: u16, payload: impl Into<Bytes>) -> Result<Self> {
        Self::new(transaction_id, MODBUS_PROTOCOL_ID, payload)
    }

    /// Build from a decoded header and payload. The caller guarantees the
    /// payload length matches the header.
    pub(crate) fn from_wire(header: Header, payload: Bytes) -> Self {
        Self {
            transaction_id: header.transaction_id,
            protocol_id: header.protocol_id,
            payload,
        }
    }

    /// Get the transaction ID.
    #[inline]
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Get the protocol ID.
    #[inline]
    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Check if this frame carries the protocol proper.
    #[inline]
    pub fn is_modbus(&self) -> bool {
        self.protocol_id == MODBUS_PROTOCOL_ID
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(
            self.transaction_id,
            self.protocol_id,
            self.payload.len() as u16,
        )
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the frame into a contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.header().encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}
