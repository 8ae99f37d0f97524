//! Protocol data units carried in protocol-0 frames.
//!
//! A request payload is `unit id ‖ function code ‖ data`; a response payload
//! has the same shape with the unit id echoed back. The transport never
//! interprets function codes or data.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{MAX_PDU_PAYLOAD_SIZE, MIN_PDU_PAYLOAD_SIZE};
use crate::error::{MbapError, Result};

/// A request addressed to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub unit_id: u8,
    pub function_code: u8,
    pub data: Bytes,
}

/// A response to a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub function_code: u8,
    pub data: Bytes,
}

impl Query {
    pub fn new(unit_id: u8, function_code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            unit_id,
            function_code,
            data: data.into(),
        }
    }

    /// Encode as a frame payload.
    pub fn to_payload(&self) -> Bytes {
        encode_pdu(self.unit_id, self.function_code, &self.data)
    }

    /// Decode from a frame payload.
    ///
    /// Fails with a communication error if the payload length is outside
    /// [2, 254].
    pub fn from_payload(payload: &Bytes) -> Result<Self> {
        check_pdu_len(payload.len())?;
        Ok(Self {
            unit_id: payload[0],
            function_code: payload[1],
            data: payload.slice(MIN_PDU_PAYLOAD_SIZE..),
        })
    }
}

impl Answer {
    pub fn new(function_code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            function_code,
            data: data.into(),
        }
    }

    /// Encode as a frame payload on behalf of `unit_id`.
    pub fn to_payload(&self, unit_id: u8) -> Bytes {
        encode_pdu(unit_id, self.function_code, &self.data)
    }

    /// Decode from a frame payload, returning the embedded unit id as well.
    pub fn from_payload(payload: &Bytes) -> Result<(u8, Self)> {
        check_pdu_len(payload.len())?;
        Ok((
            payload[0],
            Self {
                function_code: payload[1],
                data: payload.slice(MIN_PDU_PAYLOAD_SIZE..),
            },
        ))
    }

    /// Check if the function code has the exception bit set.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code & 0x80 != 0
    }
}

/// Check whether a payload length is a plausible PDU.
#[inline]
pub fn is_valid_pdu_len(len: usize) -> bool {
    (MIN_PDU_PAYLOAD_SIZE..=MAX_PDU_PAYLOAD_SIZE).contains(&len)
}

fn check_pdu_len(len: usize) -> Result<()> {
    if is_valid_pdu_len(len) {
        Ok(())
    } else {
        Err(MbapError::Communication(format!(
            "invalid PDU length {} (expected {}..={})",
            len, MIN_PDU_PAYLOAD_SIZE, MAX_PDU_PAYLOAD_SIZE
        )))
    }
}

fn encode_pdu(unit_id: u8, function_code: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_PDU_PAYLOAD_SIZE + data.len());
    buf.put_u8(unit_id);
    buf.put_u8(function_code);
    buf.put_slice(data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_query_payload_layout() {
        let query = Query::new(0x11, 0x03, vec![0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(&query.to_payload()[..], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_query_from_payload() {
        let payload = Bytes::from_static(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        let query = Query::from_payload(&payload).unwrap();
        assert_eq!(query.unit_id, 1);
        assert_eq!(query.function_code, 6);
        assert_eq!(&query.data[..], &[0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_short_payload_rejected() {
        let err = Query::from_payload(&Bytes::from_static(&[0x01])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Communication);
        assert!(Answer::from_payload(&Bytes::new()).is_err());
    }

    #[test]
    fn test_answer_keeps_unit() {
        let answer = Answer::new(0x83, vec![0x02]);
        let payload = answer.to_payload(9);
        let (unit, decoded) = Answer::from_payload(&payload).unwrap();
        assert_eq!(unit, 9);
        assert!(decoded.is_exception());
        assert_eq!(decoded, answer);
    }

    #[test]
    fn test_pdu_len_bounds() {
        assert!(!is_valid_pdu_len(1));
        assert!(is_valid_pdu_len(2));
        assert!(is_valid_pdu_len(254));
        assert!(!is_valid_pdu_len(255));
    }
}
