//! Snapshot envelope codec.
//!
//! The collaboration server hands the pipeline an opaque, self-describing
//! binary blob: a 4-byte magic, a format version byte, a big-endian u32
//! payload length, then the payload itself. Decoding validates the framing
//! only; the payload stays opaque (its interpretation belongs to the CRDT
//! library, not this pipeline).

use sha2::{Digest, Sha256};

use crate::types::{AppError, AppResult};

pub const MAGIC: [u8; 4] = *b"DSNP";
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 4;

/// Wrap a raw document payload in the snapshot envelope.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate the envelope and return the enclosed payload. All failures are
/// non-retriable: a corrupt blob will not become valid on redelivery.
pub fn decode(state: &[u8]) -> AppResult<&[u8]> {
    if state.len() < HEADER_LEN {
        return Err(AppError::Decode(format!(
            "snapshot too short: {} bytes, need at least {}",
            state.len(),
            HEADER_LEN
        )));
    }
    if state[..4] != MAGIC {
        return Err(AppError::Decode("bad snapshot magic".to_string()));
    }
    let format = state[4];
    if format != FORMAT_VERSION {
        return Err(AppError::Decode(format!(
            "unsupported snapshot format version {}",
            format
        )));
    }
    let declared = u32::from_be_bytes([state[5], state[6], state[7], state[8]]) as usize;
    let payload = &state[HEADER_LEN..];
    if payload.len() != declared {
        return Err(AppError::Decode(format!(
            "snapshot length mismatch: header says {}, got {}",
            declared,
            payload.len()
        )));
    }
    Ok(payload)
}

/// Hex sha-256 of the payload, used as the per-document idempotency key.
pub fn content_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
