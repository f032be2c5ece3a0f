//! Ingestion pipeline: decode → append → persist.
//!
//! Each inbound chunk is decoded on a blocking worker thread, appended to
//! the point arena, and durably recorded in the chunk store if not
//! already present. Recoverable conditions never stop the stream:
//!
//! - decode failures skip the chunk (logged),
//! - a full arena drops the points but still persists the chunk,
//! - a failed store write keeps the points in memory and logs a
//!   degraded-durability warning.
//!
//! # Duplicate delivery
//!
//! Redelivered chunk ids are deduplicated at the store layer only; the
//! arena is appended unconditionally. A retransmitted chunk can therefore
//! appear twice in the render arena until the next cache replay, which
//! rebuilds the arena from the deduplicated store. This is the simpler of
//! the two policies the original system mixed, and the store stays exact
//! either way.
//!
//! # Replay
//!
//! `prepare` runs after every session reconciliation, before any live
//! chunk: it resets the arena and replays `get_all_ordered()` in sequence
//! order. After a RESET the store holds nothing, so the replay is an
//! empty walk; one code path keeps the cache-before-live ordering
//! guarantee in a single place.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::{PoseRecord, RawChunk};
use crate::chunk_store::ChunkStore;
use crate::codec;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::point_buffer::{AppendOnlyPointBuffer, AppendRange};
use crate::session::SessionDecision;
use crate::transport::StreamMessage;

/// Counters the pipeline maintains while ingesting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    pub chunks_stored: u64,
    pub chunks_duplicate: u64,
    pub poses_stored: u64,
    pub points_appended: u64,
    pub points_dropped: u64,
    pub decode_failures: u64,
    pub store_failures: u64,
    pub chunks_replayed: u64,
}

/// Wires ChunkCodec → AppendOnlyPointBuffer → ChunkStore.
///
/// The pipeline is the only writer of the buffer; renderers read through
/// [`flush`](Self::flush) and [`reservoir_snapshot`](Self::reservoir_snapshot).
pub struct IngestionPipeline {
    store: Arc<ChunkStore>,
    buffer: AppendOnlyPointBuffer,
    stats: PipelineStats,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(store: Arc<ChunkStore>, config: &StreamConfig) -> Self {
        Self {
            store,
            buffer: AppendOnlyPointBuffer::new(
                config.max_points,
                config.reservoir_ratio,
                config.max_reservoir_size,
            ),
            stats: PipelineStats::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Handle one inbound stream message.
    pub async fn ingest(&mut self, message: StreamMessage) -> Result<()> {
        match message {
            StreamMessage::Chunk(raw) => self.ingest_chunk(raw).await,
            StreamMessage::Pose(pose) => {
                self.ingest_pose(&pose);
                Ok(())
            }
        }
    }

    /// Decode, append, and persist one chunk.
    pub async fn ingest_chunk(&mut self, raw: RawChunk) -> Result<()> {
        let decoded = tokio::task::spawn_blocking(move || codec::decode(&raw)).await;
        let chunk = match decoded {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => {
                warn!(error = %e, "skipping malformed chunk");
                self.stats.decode_failures += 1;
                return Ok(());
            }
            Err(join_err) => {
                warn!(error = %join_err, "decode worker failed, skipping chunk");
                self.stats.decode_failures += 1;
                return Ok(());
            }
        };

        // Store-layer dedup; the arena is appended unconditionally (see
        // module docs). `exists` only classifies the write for logging
        // and stats, the INSERT OR IGNORE is what enforces idempotence.
        let duplicate = match self.store.exists(&chunk.chunk_id) {
            Ok(d) => d,
            Err(e) => {
                warn!(chunk_id = %chunk.chunk_id, error = %e, "existence check failed");
                self.stats.store_failures += 1;
                false
            }
        };

        match self.buffer.append(&chunk.coords, &chunk.colors) {
            Ok(range) => {
                self.stats.points_appended += range.count as u64;
            }
            Err(Error::CapacityExceeded { requested, .. }) => {
                warn!(
                    chunk_id = %chunk.chunk_id,
                    dropped_points = requested,
                    "point arena full, dropping points (chunk still persisted)"
                );
                self.stats.points_dropped += chunk.point_count() as u64;
            }
            Err(e) => {
                // Post-decode the arrays are always paired; anything else
                // here is a bug worth hearing about, but not worth
                // stopping the stream for.
                warn!(chunk_id = %chunk.chunk_id, error = %e, "buffer append rejected");
            }
        }

        if duplicate {
            debug!(chunk_id = %chunk.chunk_id, "duplicate chunk, store write skipped");
            self.stats.chunks_duplicate += 1;
            return Ok(());
        }

        match self.store.put(&chunk) {
            Ok(true) => self.stats.chunks_stored += 1,
            Ok(false) => self.stats.chunks_duplicate += 1,
            Err(e) => {
                warn!(
                    chunk_id = %chunk.chunk_id,
                    error = %e,
                    "durable write failed, continuing in memory only"
                );
                self.stats.store_failures += 1;
            }
        }
        Ok(())
    }

    /// Persist one pose.
    pub fn ingest_pose(&mut self, pose: &PoseRecord) {
        match self.store.put_pose(pose) {
            Ok(true) => self.stats.poses_stored += 1,
            Ok(false) => {
                debug!(
                    trajectory_index = pose.trajectory_index,
                    "duplicate pose ignored"
                );
            }
            Err(e) => {
                warn!(error = %e, "pose write failed, continuing");
                self.stats.store_failures += 1;
            }
        }
    }

    /// Reset the arena and replay the cache in sequence order. Must
    /// complete before any live chunk of the new connection is ingested.
    pub fn prepare(&mut self, decision: &SessionDecision) -> Result<()> {
        self.buffer.reset();
        let cached = self.store.get_all_ordered()?;
        let replayed = cached.len();

        for chunk in cached {
            match self.buffer.append(&chunk.coords, &chunk.colors) {
                Ok(range) => self.stats.points_appended += range.count as u64,
                Err(Error::CapacityExceeded { requested, .. }) => {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        dropped_points = requested,
                        "arena full during cache replay"
                    );
                    self.stats.points_dropped += chunk.point_count() as u64;
                }
                Err(e) => return Err(e),
            }
        }

        self.stats.chunks_replayed += replayed as u64;
        info!(
            session_id = %decision.descriptor().session_id,
            reset = decision.is_reset(),
            replayed_chunks = replayed,
            buffered_points = self.buffer.write_index(),
            "cache replay complete"
        );
        Ok(())
    }

    /// Range appended since the last flush, for the renderer to upload.
    pub fn flush(&mut self) -> AppendRange {
        self.buffer.flush()
    }

    /// Sampled arena indices for picking.
    #[must_use]
    pub fn reservoir_snapshot(&self) -> &[usize] {
        self.buffer.reservoir_snapshot()
    }

    #[must_use]
    pub fn buffer(&self) -> &AppendOnlyPointBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
