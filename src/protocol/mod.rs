//! Protocol module - wire format, framing, and PDU types.
//!
//! This module implements the binary protocol:
//! - 6-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Query/Answer protocol data units

mod frame;
mod frame_buffer;
mod pdu;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use pdu::{is_valid_pdu_len, Answer, Query};
pub use wire_format::{
    validate_payload_len, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_PDU_DATA_SIZE,
    MAX_PDU_PAYLOAD_SIZE, MIN_PDU_PAYLOAD_SIZE, MODBUS_PROTOCOL_ID,
};
