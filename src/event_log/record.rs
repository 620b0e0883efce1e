//! Journal record framing
//!
//! Each journal record is laid out as:
//! - Payload length (u32 LE)
//! - CRC32 of the payload (u32 LE)
//! - Payload: one JSON-encoded [`JournalOp`]
//!
//! Every state change of a stream (appends, group creation, deliveries,
//! acks, claims, trims) is one record, so replaying a journal from the
//! first record rebuilds the exact stream state.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::Event;

/// Size of the length + checksum header
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single record payload
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// A single state transition of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// Entry appended at `offset`
    Append { offset: u64, event: Event },

    /// Group created with its cursor at `last_delivered`
    CreateGroup { group: String, last_delivered: u64 },

    /// Entries delivered (or redelivered) to a consumer
    Deliver {
        group: String,
        consumer: String,
        offsets: Vec<u64>,
        at_ms: i64,
    },

    /// Entries acknowledged
    Ack { group: String, offsets: Vec<u64> },

    /// Pending entries moved to another consumer
    Claim {
        group: String,
        consumer: String,
        offsets: Vec<u64>,
        at_ms: i64,
    },

    /// Entries with offset below `before` dropped by retention
    Trim { before: u64 },
}

/// Computes the CRC32 (IEEE) checksum of `data`
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Why an op could not be framed
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize journal op: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Would be rejected by [`decode`] on replay
    #[error("journal record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Encodes an op into a framed record
pub fn encode(op: &JournalOp) -> Result<Vec<u8>, EncodeError> {
    let payload = serde_json::to_vec(op)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::TooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compute_checksum(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Outcome of decoding one record from the front of a buffer
#[derive(Debug)]
pub enum Decoded {
    /// A complete, valid record and the number of bytes it used
    Record(JournalOp, usize),
    /// The buffer ends before the record does
    Incomplete,
    /// The record is complete but invalid
    Corrupt(String),
}

/// Decodes the record at the start of `buf`
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let checksum = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len > MAX_PAYLOAD_LEN {
        return Decoded::Corrupt(format!("record length {} exceeds limit", len));
    }
    if buf.len() < HEADER_LEN + len {
        return Decoded::Incomplete;
    }

    let payload = &buf[HEADER_LEN..HEADER_LEN + len];
    if compute_checksum(payload) != checksum {
        return Decoded::Corrupt("checksum mismatch".to_string());
    }

    match serde_json::from_slice(payload) {
        Ok(op) => Decoded::Record(op, HEADER_LEN + len),
        Err(e) => Decoded::Corrupt(format!("undecodable payload: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_append() -> JournalOp {
        JournalOp::Append {
            offset: 7,
            event: Event::with_id("e7", "finbot.tx.created", "finbot", json!({"amount": 5})),
        }
    }

    #[test]
    fn test_checksum_deterministic() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
    }

    #[test]
    fn test_decode_reports_consumed_bytes() {
        let op = sample_append();
        let mut buf = encode(&op).unwrap();
        let first_len = buf.len();
        buf.extend(encode(&JournalOp::Trim { before: 3 }).unwrap());

        match decode(&buf) {
            Decoded::Record(decoded, used) => {
                assert_eq!(decoded, op);
                assert_eq!(used, first_len);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_record_is_incomplete() {
        let buf = encode(&sample_append()).unwrap();
        assert!(matches!(decode(&buf[..buf.len() - 1]), Decoded::Incomplete));
        assert!(matches!(decode(&buf[..3]), Decoded::Incomplete));
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut buf = encode(&sample_append()).unwrap();
        let last = buf.len() - 2;
        buf[last] ^= 0xFF;
        assert!(matches!(decode(&buf), Decoded::Corrupt(_)));
    }

    #[test]
    fn test_encode_refuses_payload_decode_would_reject() {
        let op = JournalOp::Append {
            offset: 1,
            event: Event::with_id(
                "big",
                "finbot.tx.created",
                "finbot",
                json!({"blob": "x".repeat(MAX_PAYLOAD_LEN)}),
            ),
        };
        assert!(matches!(encode(&op), Err(EncodeError::TooLarge { .. })));
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(decode(&buf), Decoded::Corrupt(_)));
    }
}
