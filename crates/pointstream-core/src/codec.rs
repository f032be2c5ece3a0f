//! Chunk decoding: wire message → typed coordinate/color arrays.
//!
//! `decode` is a pure function: same input, same output, no state and no
//! retry semantics. The pipeline runs it on a blocking worker thread so a
//! large chunk never stalls the stream read loop.
//!
//! Nested groups may be empty or absent; that decodes to empty arrays,
//! not an error. Missing identity fields and coordinate/color mismatches
//! are [`DecodeError`]s: malformed messages are rejected at this boundary
//! instead of flowing through the pipeline as half-formed values.

use crate::chunk::{Chunk, RawChunk};
use crate::error::DecodeError;

/// Decode and validate a raw wire chunk.
pub fn decode(raw: &RawChunk) -> Result<Chunk, DecodeError> {
    if raw.chunk_id.is_empty() {
        return Err(DecodeError::MissingChunkId);
    }
    if raw.session_id.is_empty() {
        return Err(DecodeError::MissingSessionId {
            chunk_id: raw.chunk_id.clone(),
        });
    }

    let total: usize = raw.point_groups.iter().map(|g| g.points.len()).sum();
    let mut coords = Vec::with_capacity(total * 3);
    let mut colors = Vec::with_capacity(total * 3);

    for group in &raw.point_groups {
        for point in &group.points {
            if !(point.x.is_finite() && point.y.is_finite() && point.z.is_finite()) {
                return Err(DecodeError::NonFiniteCoordinate {
                    chunk_id: raw.chunk_id.clone(),
                    index: coords.len() / 3,
                });
            }
            coords.extend_from_slice(&[point.x, point.y, point.z]);
            colors.extend_from_slice(&[point.r, point.g, point.b]);
        }
    }

    debug_assert_eq!(coords.len(), colors.len());

    Ok(Chunk {
        chunk_id: raw.chunk_id.clone(),
        sequence_number: raw.sequence_number,
        session_id: raw.session_id.clone(),
        timestamp_ms: raw.timestamp_ms,
        coords,
        colors,
    })
}
