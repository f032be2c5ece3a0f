//! Transport seam between the supervisor and the remote service.
//!
//! The remote sensing service is reached through two operations: a
//! request/response session query and a long-lived server stream of
//! chunk and pose messages. Both are modeled as traits so the supervisor
//! can be driven by a real gRPC binding, by a replay harness, or by the
//! scripted transports the tests use.
//!
//! Reads are consumer-driven: the supervisor awaits `next_message` when
//! it is ready for more, which gives the stream natural backpressure
//! instead of push-only callbacks.

use tokio::sync::mpsc;

use crate::chunk::{CacheState, PoseRecord, RawChunk, SessionDescriptor};
use crate::error::StreamError;

/// One inbound message from the live stream.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Chunk(RawChunk),
    Pose(PoseRecord),
}

/// An open server stream. `next_message` returns `None` when the server
/// ends the stream cleanly.
pub trait ChunkStream: Send {
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Option<Result<StreamMessage, StreamError>>> + Send;
}

/// Connection factory for the remote service.
pub trait ChunkTransport: Send {
    type Stream: ChunkStream;

    /// Open a fresh server stream. `cache_state` is advisory: the server
    /// may use it to skip redelivery, the client never depends on it.
    fn open_stream(
        &mut self,
        cache_state: &CacheState,
    ) -> impl Future<Output = Result<Self::Stream, StreamError>> + Send;

    /// Request the server's current session descriptor.
    fn session_info(
        &mut self,
    ) -> impl Future<Output = Result<SessionDescriptor, StreamError>> + Send;
}

// =============================================================================
// Channel-backed transport
// =============================================================================

/// A [`ChunkStream`] over a tokio mpsc channel. The producing side is a
/// plain sender, so hosts can bridge any callback-style binding into the
/// supervisor by forwarding messages into the channel.
pub struct ChannelStream {
    rx: mpsc::Receiver<Result<StreamMessage, StreamError>>,
}

impl ChannelStream {
    /// Create a stream with the given channel depth, returning the
    /// producer handle alongside it.
    #[must_use]
    pub fn new(depth: usize) -> (mpsc::Sender<Result<StreamMessage, StreamError>>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, Self { rx })
    }
}

impl ChunkStream for ChannelStream {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>> {
        self.rx.recv().await
    }
}
