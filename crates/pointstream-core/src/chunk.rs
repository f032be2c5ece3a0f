//! Wire and domain data types.
//!
//! The inbound stream delivers loosely structured chunk messages
//! ([`RawChunk`]). The codec validates them at the ingestion boundary and
//! produces typed [`Chunk`] records; everything past the codec works with
//! `Chunk` only, so a malformed message can never turn into a silent
//! `None` deep in the pipeline.

use serde::{Deserialize, Serialize};

// =============================================================================
// Wire types
// =============================================================================

/// One point as it appears on the wire: position plus color.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// A nested group of points. Groups may be empty or missing entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointGroup {
    #[serde(default)]
    pub points: Vec<RawPoint>,
}

/// The inbound per-chunk stream message, prior to validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawChunk {
    pub chunk_id: String,
    pub sequence_number: u64,
    pub session_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub point_groups: Vec<PointGroup>,
}

// =============================================================================
// Domain types
// =============================================================================

/// A validated, decoded chunk: flat coordinate/color arrays in encounter
/// order, three values per point.
///
/// Invariant: `coords.len() == colors.len()` and both are multiples of 3.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub sequence_number: u64,
    pub session_id: String,
    pub timestamp_ms: u64,
    pub coords: Vec<f32>,
    pub colors: Vec<f32>,
}

impl Chunk {
    /// Number of points carried by this chunk.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.coords.len() / 3
    }

    /// Approximate in-memory payload size in bytes.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        (self.coords.len() + self.colors.len()) * std::mem::size_of::<f32>()
    }
}

/// The server's session identity, returned by the session query and
/// persisted as the singleton `session_info` record.
///
/// A session is keyed by `session_id`; a changed `start_time` with the
/// same id means the server restarted and the cache is stale anyway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDescriptor {
    pub session_id: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: u64,
    pub is_active: bool,
    pub clients_connected: u32,
}

impl Default for SessionDescriptor {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            start_time: 0,
            is_active: false,
            clients_connected: 0,
        }
    }
}

impl SessionDescriptor {
    /// An empty session id means the server has no session yet.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// A cached camera pose. Poses ride the same stream as chunks and are
/// persisted so a reload restores the trajectory along with the geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub session_id: String,
    /// Position within the trajectory; unique per session.
    pub trajectory_index: u64,
    /// Column-major 4x4 transform.
    pub matrix: [f32; 16],
    pub position: [f32; 3],
    pub timestamp_ms: u64,
}

/// Advisory client cache state, sent to the server when opening a stream
/// so it can skip redelivering chunks the client already holds. The
/// reconciler never depends on the server honoring it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub chunk_count: u64,
}
