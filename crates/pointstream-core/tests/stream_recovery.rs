//! End-to-end stream recovery scenarios.
//!
//! These tests drive a real supervisor + pipeline + SQLite store against
//! a scripted in-process transport, covering the lifecycle the crate
//! exists for: first contact, restart with a warm cache, retransmission,
//! stalls, session switches, and retry exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pointstream_core::chunk::{PointGroup, RawPoint};
use pointstream_core::transport::ChannelStream;
use pointstream_core::{
    CacheState, ChunkStore, ChunkStream, ChunkTransport, ConnectionSupervisor, Error,
    IngestionPipeline, RawChunk, SessionDescriptor, StreamConfig, StreamError, StreamMessage,
    SupervisorState,
};

// =============================================================================
// Scripted transport
// =============================================================================

/// What one connection attempt should do.
#[derive(Clone)]
enum Script {
    /// Deliver messages, then close the stream.
    Deliver(Vec<StreamMessage>),
    /// Deliver messages, then go silent until the stall timeout fires.
    DeliverThenHang(Vec<StreamMessage>),
    /// Refuse the connection.
    Refuse,
}

struct ScriptedTransport {
    session: SessionDescriptor,
    scripts: Vec<Script>,
    connects: Arc<AtomicU32>,
    /// Cache state the supervisor sent with each open, in order.
    cache_states: Arc<std::sync::Mutex<Vec<CacheState>>>,
}

impl ScriptedTransport {
    fn new(session: SessionDescriptor, scripts: Vec<Script>) -> Self {
        Self {
            session,
            scripts,
            connects: Arc::new(AtomicU32::new(0)),
            cache_states: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

struct ScriptedStream {
    inner: ChannelStream,
    _tx: Option<tokio::sync::mpsc::Sender<Result<StreamMessage, StreamError>>>,
}

impl ChunkStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>> {
        self.inner.next_message().await
    }
}

impl ChunkTransport for ScriptedTransport {
    type Stream = ScriptedStream;

    async fn open_stream(
        &mut self,
        cache_state: &CacheState,
    ) -> Result<Self::Stream, StreamError> {
        self.cache_states.lock().unwrap().push(cache_state.clone());
        let n = self.connects.fetch_add(1, Ordering::SeqCst) as usize;
        match self.scripts.get(n).cloned().unwrap_or(Script::Refuse) {
            Script::Refuse => Err(StreamError::Transport("connection refused".into())),
            Script::Deliver(messages) => {
                let (tx, stream) = ChannelStream::new(messages.len().max(1));
                for m in messages {
                    let _ = tx.send(Ok(m)).await;
                }
                Ok(ScriptedStream {
                    inner: stream,
                    _tx: None,
                })
            }
            Script::DeliverThenHang(messages) => {
                let (tx, stream) = ChannelStream::new(messages.len().max(1));
                for m in messages {
                    let _ = tx.send(Ok(m)).await;
                }
                Ok(ScriptedStream {
                    inner: stream,
                    _tx: Some(tx),
                })
            }
        }
    }

    async fn session_info(&mut self) -> Result<SessionDescriptor, StreamError> {
        Ok(self.session.clone())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn descriptor(id: &str, start: u64) -> SessionDescriptor {
    SessionDescriptor {
        session_id: id.into(),
        start_time: start,
        is_active: true,
        clients_connected: 1,
    }
}

fn chunk(session: &str, id: &str, seq: u64, points: usize) -> StreamMessage {
    StreamMessage::Chunk(RawChunk {
        chunk_id: id.into(),
        sequence_number: seq,
        session_id: session.into(),
        timestamp_ms: 1_000 + seq,
        point_groups: vec![PointGroup {
            points: (0..points)
                .map(|i| RawPoint {
                    x: seq as f32,
                    y: i as f32,
                    z: 0.0,
                    r: 1.0,
                    g: 1.0,
                    b: 1.0,
                })
                .collect(),
        }],
    })
}

fn test_config() -> StreamConfig {
    StreamConfig {
        max_points: 10_000,
        reservoir_ratio: 1.0,
        max_reservoir_size: 64,
        stale_timeout_ms: 40,
        max_retries: 1,
        backoff_ms: 5,
        backoff_max_ms: 20,
        session_query_timeout_ms: 200,
        ..StreamConfig::default()
    }
}

async fn run_until_abort<T: ChunkTransport>(
    supervisor: &mut ConnectionSupervisor<T>,
    pipeline: &mut IngestionPipeline,
) -> Error {
    supervisor.run(pipeline).await.unwrap_err()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn first_contact_streams_and_caches() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![Script::Deliver(vec![
            chunk("s1", "c0", 0, 3),
            chunk("s1", "c1", 1, 2),
        ])],
    );
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &test_config());

    let err = run_until_abort(&mut supervisor, &mut pipeline).await;
    assert!(matches!(err, Error::RetriesExhausted { .. }));

    // Everything that streamed landed in both the arena and the cache.
    assert_eq!(pipeline.buffer().write_index(), 5);
    let stats = store.stats().unwrap();
    assert_eq!(stats.total_chunks, 2);
    assert_eq!(stats.total_points, 5);
    assert_eq!(store.load_session().unwrap(), Some(descriptor("s1", 100)));
}

#[tokio::test]
async fn restart_replays_cache_before_live_data() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("cache.db");

    // First run caches two chunks.
    {
        let store = Arc::new(ChunkStore::open(&db).unwrap());
        let transport = ScriptedTransport::new(
            descriptor("s1", 100),
            vec![Script::Deliver(vec![
                chunk("s1", "c0", 0, 2),
                chunk("s1", "c1", 1, 2),
            ])],
        );
        let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
        let mut pipeline = IngestionPipeline::new(store, &test_config());
        let _ = run_until_abort(&mut supervisor, &mut pipeline).await;
    }

    // Second run: same session, fresh process. The cached chunks occupy
    // the front of the arena before the new live chunk arrives.
    let store = Arc::new(ChunkStore::open(&db).unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![Script::Deliver(vec![chunk("s1", "c2", 2, 1)])],
    );
    let cache_seen = Arc::clone(&transport.cache_states);
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &test_config());
    let _ = run_until_abort(&mut supervisor, &mut pipeline).await;

    // 4 replayed points then 1 live point, in sequence order.
    assert_eq!(pipeline.buffer().write_index(), 5);
    assert_eq!(pipeline.buffer().positions()[0], 0.0); // seq 0 first
    assert!(pipeline.stats().chunks_replayed >= 2);
    assert_eq!(store.stats().unwrap().total_chunks, 3);

    // The first open was told what the cache already held.
    let sent = cache_seen.lock().unwrap()[0].clone();
    assert_eq!(sent.last_sequence, Some(1));
    assert_eq!(sent.chunk_count, 2);
}

#[tokio::test]
async fn retransmitted_chunk_is_cached_once() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![
            Script::Deliver(vec![chunk("s1", "c0", 0, 2)]),
            // Reconnect redelivers c0 alongside the next chunk.
            Script::Deliver(vec![chunk("s1", "c0", 0, 2), chunk("s1", "c1", 1, 2)]),
        ],
    );
    let config = StreamConfig {
        max_retries: 2,
        ..test_config()
    };
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, config.clone());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &config);
    let _ = run_until_abort(&mut supervisor, &mut pipeline).await;

    // The store keeps one copy per chunk id.
    assert_eq!(store.stats().unwrap().total_chunks, 2);
    assert_eq!(pipeline.stats().chunks_duplicate, 1);

    // Replay on the second connect rebuilt the arena from the
    // deduplicated store, so c0 counts once plus its redelivery.
    assert_eq!(store.get_all_ordered().unwrap().len(), 2);
}

#[tokio::test]
async fn stalled_stream_reconnects_and_resumes() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![
            Script::DeliverThenHang(vec![chunk("s1", "c0", 0, 1)]),
            Script::DeliverThenHang(vec![chunk("s1", "c1", 1, 1)]),
        ],
    );
    let connects = Arc::clone(&transport.connects);
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &test_config());

    let err = run_until_abort(&mut supervisor, &mut pipeline).await;
    assert!(matches!(err, Error::RetriesExhausted { .. }));

    // The stall was detected and a second connection made progress.
    assert!(connects.load(Ordering::SeqCst) >= 2);
    assert!(store.exists("c0").unwrap());
    assert!(store.exists("c1").unwrap());
}

#[tokio::test]
async fn refused_connections_abort_after_max_retries() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![Script::Refuse, Script::Refuse, Script::Refuse],
    );
    let connects = Arc::clone(&transport.connects);
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(store, &test_config());

    let err = run_until_abort(&mut supervisor, &mut pipeline).await;
    assert!(matches!(err, Error::RetriesExhausted { attempts: 2 }));
    assert_eq!(supervisor.state(), SupervisorState::Aborted);
    // max_retries = 1 allows the initial attempt plus one retry.
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn session_switch_clears_old_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("cache.db");

    // Cache chunks under session s1.
    {
        let store = Arc::new(ChunkStore::open(&db).unwrap());
        let transport = ScriptedTransport::new(
            descriptor("s1", 100),
            vec![Script::Deliver(vec![
                chunk("s1", "c0", 0, 2),
                chunk("s1", "c1", 1, 2),
            ])],
        );
        let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
        let mut pipeline = IngestionPipeline::new(store, &test_config());
        let _ = run_until_abort(&mut supervisor, &mut pipeline).await;
    }

    // The server started a new session: the old cache must not leak
    // into the new buffer.
    let store = Arc::new(ChunkStore::open(&db).unwrap());
    let transport = ScriptedTransport::new(
        descriptor("s2", 500),
        vec![Script::Deliver(vec![chunk("s2", "d0", 0, 1)])],
    );
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &test_config());
    let _ = run_until_abort(&mut supervisor, &mut pipeline).await;

    assert!(store.get_by_session("s1").unwrap().is_empty());
    assert_eq!(store.get_by_session("s2").unwrap().len(), 1);
    assert_eq!(pipeline.buffer().write_index(), 1);
    assert_eq!(store.load_session().unwrap(), Some(descriptor("s2", 500)));
}

#[tokio::test]
async fn stop_during_backoff_returns_cleanly() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let transport = ScriptedTransport::new(descriptor("s1", 100), vec![Script::Refuse]);
    let config = StreamConfig {
        backoff_ms: 5_000,
        backoff_max_ms: 5_000,
        max_retries: 5,
        ..test_config()
    };
    let (mut supervisor, stop) = ConnectionSupervisor::new(transport, config.clone());
    let mut pipeline = IngestionPipeline::new(store, &config);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.stop();
    });

    supervisor.run(&mut pipeline).await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    stopper.await.unwrap();
}

#[tokio::test]
async fn poses_survive_alongside_chunks() {
    let store = Arc::new(ChunkStore::in_memory().unwrap());
    let pose = pointstream_core::PoseRecord {
        session_id: "s1".into(),
        trajectory_index: 0,
        matrix: [0.0; 16],
        position: [1.0, 2.0, 3.0],
        timestamp_ms: 1_000,
    };
    let transport = ScriptedTransport::new(
        descriptor("s1", 100),
        vec![Script::Deliver(vec![
            chunk("s1", "c0", 0, 1),
            StreamMessage::Pose(pose),
        ])],
    );
    let (mut supervisor, _stop) = ConnectionSupervisor::new(transport, test_config());
    let mut pipeline = IngestionPipeline::new(Arc::clone(&store), &test_config());
    let _ = run_until_abort(&mut supervisor, &mut pipeline).await;

    let poses = store.poses_by_session("s1").unwrap();
    assert_eq!(poses.len(), 1);
    assert_eq!(poses[0].position, [1.0, 2.0, 3.0]);
    assert_eq!(pipeline.stats().poses_stored, 1);
}
