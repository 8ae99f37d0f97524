//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 6 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//! - `Discarding`: Header announced an oversized protocol-0 frame; its payload
//!   is skipped and the frame is dropped
//!
//! Oversized protocol-0 frames are tolerated rather than treated as fatal, so
//! a stray or corrupt frame on the wire does not take the connection down.
//!
//! # Example
//!
//! ```
//! use mbap_transport::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03]);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].transaction_id(), 1);
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{Header, HEADER_SIZE};
use super::Frame;

/// Default read buffer capacity.
const DEFAULT_CAPACITY: usize = 8 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 6 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
    /// Skipping the payload of a dropped frame.
    Discarding { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Number of frames dropped for an invalid length.
    dropped: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default capacity (8KB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new frame buffer with custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            dropped: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Read whatever the reader has available into the buffer.
    ///
    /// Returns the number of bytes read; 0 means end of stream.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if self.buffer.capacity() - self.buffer.len() < HEADER_SIZE {
            self.buffer.reserve(DEFAULT_CAPACITY);
        }
        reader.read_buf(&mut self.buffer).await
    }

    /// Try to extract a single frame from the buffered bytes.
    ///
    /// Returns `None` if more data is needed. Dropped frames are skipped
    /// transparently.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = Header::decode(&self.buffer)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if !header.has_valid_length() {
                        tracing::debug!(
                            transaction_id = header.transaction_id,
                            length = header.payload_length,
                            "dropping oversized frame"
                        );
                        self.dropped += 1;
                        self.state = State::Discarding {
                            remaining: header.payload_length as usize,
                        };
                        continue;
                    }

                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let len = header.payload_length as usize;
                    if self.buffer.len() < len {
                        return None;
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = State::WaitingForHeader;
                    return Some(Frame::from_wire(header, payload));
                }

                State::Discarding { remaining } => {
                    let skip = (*remaining).min(self.buffer.len());
                    let _ = self.buffer.split_to(skip);
                    let remaining = *remaining - skip;
                    if remaining > 0 {
                        self.state = State::Discarding { remaining };
                        return None;
                    }
                    self.state = State::WaitingForHeader;
                }
            }
        }
    }

    /// Check whether a frame has been started but not completed.
    ///
    /// At end of stream this indicates a short read.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || !matches!(self.state, State::WaitingForHeader)
    }

    /// Number of frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Discarding { .. } => "Discarding",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to create a frame as bytes without payload validation.
    fn make_frame_bytes(transaction_id: u16, protocol_id: u16, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(transaction_id, protocol_id, payload.len() as u16);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, 0, b"\x01\x03hello"));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id(), 42);
        assert_eq!(frames[0].payload(), b"\x01\x03hello");
        assert!(buffer.is_empty());
        assert!(!buffer.is_mid_frame());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = make_frame_bytes(1, 0, b"\x01\x03");
        combined.extend(make_frame_bytes(2, 0, b"\x01\x04"));
        combined.extend(make_frame_bytes(3, 5, b"x"));

        let frames = buffer.push(&combined);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].transaction_id(), 1);
        assert_eq!(frames[1].transaction_id(), 2);
        assert_eq!(frames[2].protocol_id(), 5);
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(7, 0, b"\x01\x03");

        assert!(buffer.push(&bytes[..3]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_mid_frame());

        let frames = buffer.push(&bytes[3..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id(), 7);
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = [0x01, 0x10, 0, 1, 0, 2, 4, 0xDE, 0xAD, 0xBE, 0xEF];
        let bytes = make_frame_bytes(9, 0, &payload);

        assert!(buffer.push(&bytes[..HEADER_SIZE + 4]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&bytes[HEADER_SIZE + 4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &payload);
    }

    #[test]
    fn test_oversized_modbus_frame_dropped() {
        let mut buffer = FrameBuffer::new();
        let mut data = make_frame_bytes(1, 0, &[0xAA; 300]);
        data.extend(make_frame_bytes(2, 0, b"\x01\x03"));

        let frames = buffer.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].transaction_id(), 2);
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_oversized_frame_dropped_across_pushes() {
        let mut buffer = FrameBuffer::new();
        let bad = make_frame_bytes(1, 0, &[0xAA; 300]);

        assert!(buffer.push(&bad[..100]).is_empty());
        assert_eq!(buffer.state_name(), "Discarding");
        assert!(buffer.push(&bad[100..]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&make_frame_bytes(2, 0, b"\x01\x03"));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_large_frame_other_protocol_kept() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(1, 1, &[0x55; 1000]));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload_len(), 1000);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(1, 0, b"\x01\x03hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]));
        }

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload(), b"\x01\x03hi");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(1, 0, b"\x01\x03");
        buffer.push(&bytes[..HEADER_SIZE]);
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(!buffer.is_mid_frame());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let data = make_frame_bytes(3, 0, b"\x02\x04\x00\x01");
        let mut reader = std::io::Cursor::new(data);
        let mut buffer = FrameBuffer::new();

        let n = buffer.read_from(&mut reader).await.unwrap();
        assert_eq!(n, HEADER_SIZE + 4);
        let frame = buffer.next_frame().unwrap();
        assert_eq!(frame.transaction_id(), 3);

        assert_eq!(buffer.read_from(&mut reader).await.unwrap(), 0);
    }
}
