//! pointstream-core: point-cloud stream ingestion with durable caching
//!
//! This crate receives a live stream of point-cloud chunks from a remote
//! sensing service, decodes them into GPU-ready coordinate/color arrays,
//! accumulates them in an append-only arena, and mirrors them into a
//! durable SQLite cache so a restart replays instead of re-downloading.
//!
//! # Architecture
//!
//! ```text
//! Transport → ConnectionSupervisor → IngestionPipeline
//!                  (retry/backoff)     ↓          ↓
//!                                  ChunkStore  AppendOnlyPointBuffer
//!                                  (SQLite)    (arena + reservoir)
//! ```
//!
//! # Modules
//!
//! - `chunk`: wire and decoded chunk types, session descriptors, poses
//! - `codec`: raw chunk → flat coordinate/color arrays
//! - `point_buffer`: append-only arena with a picking reservoir
//! - `chunk_store`: durable SQLite chunk/pose/session cache
//! - `session`: reconcile the cache against the server session
//! - `transport`: stream and transport traits the host implements
//! - `supervisor`: connect/stream/backoff state machine
//! - `pipeline`: decode → append → persist wiring
//! - `export`: ASCII PLY export of cached sessions
//! - `config`: host-injected configuration
//! - `logging`: tracing subscriber setup
//! - `error`: crate-wide error taxonomy
//!
//! The crate has no CLI and opens no sockets itself; the host supplies a
//! [`transport::ChunkTransport`] and owns the render loop.

pub mod chunk;
pub mod chunk_store;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod pipeline;
pub mod point_buffer;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use chunk::{CacheState, Chunk, PoseRecord, RawChunk, SessionDescriptor};
pub use chunk_store::{ChunkStore, StoreStats};
pub use config::StreamConfig;
pub use error::{DecodeError, Error, Result, StoreError, StreamError};
pub use pipeline::{IngestionPipeline, PipelineStats};
pub use point_buffer::{AppendOnlyPointBuffer, AppendRange};
pub use session::SessionDecision;
pub use supervisor::{ConnectionSupervisor, StopHandle, SupervisorState, SupervisorStats};
pub use transport::{ChunkStream, ChunkTransport, StreamMessage};
