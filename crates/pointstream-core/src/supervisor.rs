//! Connection supervision: retry, backoff, and stall detection.
//!
//! One authoritative state machine wraps the long-lived stream:
//!
//! ```text
//! Idle → Connecting → Streaming → (Erroring | Stalled) → Backoff → Connecting …
//!                                                      ↘ Aborted (retries exhausted)
//! ```
//!
//! Each connection attempt reconciles the session first, replays the
//! cache through the pipeline, then consumes the stream until it errors,
//! ends, or stalls (no message within the liveness timeout). Failures
//! feed a capped-exponential backoff; the retry counter resets to zero
//! only after streaming has been sustained for a configurable window, so
//! a connection that flaps right after opening still burns attempts.
//!
//! `stop()` (via the [`StopHandle`]) is honored from any state: the run
//! loop returns to Idle, releases the transport stream, and suppresses
//! further retries. All throughput counters are explicit
//! [`SupervisorStats`] fields sampled by the host, never free-floating
//! module state.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::chunk_store::ChunkStore;
use crate::config::StreamConfig;
use crate::error::{Error, Result, StreamError};
use crate::pipeline::IngestionPipeline;
use crate::session::{self, SessionDecision};
use crate::transport::{ChunkStream, ChunkTransport, StreamMessage};

// =============================================================================
// Backoff policy
// =============================================================================

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Multiplier applied per failed attempt.
    pub factor: f64,
    /// Random jitter range as a fraction of the delay.
    pub jitter_percent: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            ..Self::default()
        }
    }

    /// Delay for a 0-indexed attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        // Cap the exponent so powi cannot overflow.
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.factor.max(1.0).powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let range = base_ms * self.jitter_percent;
            if range > 0.0 {
                rng.random_range(-range..=range)
            } else {
                0.0
            }
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Streaming,
    Stalled,
    Erroring,
    Backoff,
    Aborted,
}

/// Snapshot of supervisor counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub state: SupervisorState,
    pub consecutive_failures: u32,
    pub packets_received: u64,
    pub chunks_received: u64,
    pub poses_received: u64,
    /// Milliseconds since the last inbound message, while streaming.
    pub since_last_packet_ms: Option<u64>,
    /// Milliseconds the current stream has been up.
    pub streaming_for_ms: Option<u64>,
}

/// Handle to stop a running supervisor from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Request a stop. Safe to call from any state, more than once.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

enum StreamEnd {
    Stopped,
}

/// Owns the retry/backoff/liveness state machine around a single
/// long-lived stream.
pub struct ConnectionSupervisor<T: ChunkTransport> {
    transport: T,
    config: StreamConfig,
    backoff: BackoffPolicy,
    state: SupervisorState,
    consecutive_failures: u32,
    packets_received: u64,
    chunks_received: u64,
    poses_received: u64,
    last_packet_at: Option<Instant>,
    streaming_since: Option<Instant>,
    stop_rx: watch::Receiver<bool>,
}

impl<T: ChunkTransport> ConnectionSupervisor<T> {
    /// Create a supervisor and the handle that stops it.
    #[must_use]
    pub fn new(transport: T, config: StreamConfig) -> (Self, StopHandle) {
        let (tx, rx) = watch::channel(false);
        let backoff = BackoffPolicy::from_config(&config);
        (
            Self {
                transport,
                config,
                backoff,
                state: SupervisorState::Idle,
                consecutive_failures: 0,
                packets_received: 0,
                chunks_received: 0,
                poses_received: 0,
                last_packet_at: None,
                streaming_since: None,
                stop_rx: rx,
            },
            StopHandle { tx },
        )
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            packets_received: self.packets_received,
            chunks_received: self.chunks_received,
            poses_received: self.poses_received,
            since_last_packet_ms: self
                .last_packet_at
                .map(|t| t.elapsed().as_millis() as u64),
            streaming_for_ms: self
                .streaming_since
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves when a stop is requested. If every [`StopHandle`] has
    /// been dropped no stop can ever arrive, so the future parks instead
    /// of resolving with an error in a loop.
    async fn stopped(rx: &mut watch::Receiver<bool>) {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drive the connect/stream/backoff loop until stopped or retries
    /// are exhausted.
    ///
    /// Calling `run` again after an abort is an explicit restart: the
    /// failure counter starts from zero.
    pub async fn run(&mut self, pipeline: &mut IngestionPipeline) -> Result<()> {
        self.consecutive_failures = 0;

        loop {
            if self.stop_requested() {
                self.state = SupervisorState::Idle;
                return Ok(());
            }

            self.state = SupervisorState::Connecting;
            match self.connect_and_stream(pipeline).await {
                Ok(StreamEnd::Stopped) => {
                    info!("supervisor stopped");
                    self.state = SupervisorState::Idle;
                    self.streaming_since = None;
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "non-retryable failure, aborting");
                    self.state = SupervisorState::Aborted;
                    return Err(e);
                }
                Err(e) => {
                    self.streaming_since = None;
                    self.consecutive_failures += 1;
                    if self.consecutive_failures > self.config.max_retries {
                        warn!(
                            attempts = self.consecutive_failures,
                            max_retries = self.config.max_retries,
                            error = %e,
                            "retries exhausted"
                        );
                        self.state = SupervisorState::Aborted;
                        return Err(Error::RetriesExhausted {
                            attempts: self.consecutive_failures,
                        });
                    }

                    self.state = SupervisorState::Backoff;
                    let delay = self.backoff.delay_for_attempt(self.consecutive_failures - 1);
                    debug!(
                        attempt = self.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "reconnecting after failure"
                    );

                    tokio::select! {
                        () = sleep(delay) => {}
                        () = Self::stopped(&mut self.stop_rx) => {
                            self.state = SupervisorState::Idle;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// One connection attempt: reconcile, replay, then consume the stream.
    async fn connect_and_stream(
        &mut self,
        pipeline: &mut IngestionPipeline,
    ) -> Result<StreamEnd> {
        // Session decision first, before any chunk is accepted, so two
        // sessions can never mix in one buffer.
        let store: &ChunkStore = pipeline.store();
        let decision = session::reconcile(
            store,
            &mut self.transport,
            self.config.session_query_timeout(),
        )
        .await?;
        let cache = session::cache_state(store, &decision.descriptor().session_id)?;

        // Cache replay completes before the first live chunk.
        pipeline.prepare(&decision)?;
        self.log_decision(&decision);

        // Opening the stream is bounded the same way reads are: a hung
        // connect counts as a stall, and stop() interrupts it.
        let stale = self.config.stale_timeout();
        let mut stream = tokio::select! {
            opened = timeout(stale, self.transport.open_stream(&cache)) => match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.state = SupervisorState::Erroring;
                    return Err(e.into());
                }
                Err(_elapsed) => {
                    self.state = SupervisorState::Stalled;
                    return Err(StreamError::Stalled {
                        idle_ms: self.config.stale_timeout_ms,
                    }
                    .into());
                }
            },
            () = Self::stopped(&mut self.stop_rx) => return Ok(StreamEnd::Stopped),
        };

        loop {
            if self.stop_requested() {
                return Ok(StreamEnd::Stopped);
            }

            let next = tokio::select! {
                msg = timeout(stale, stream.next_message()) => msg,
                () = Self::stopped(&mut self.stop_rx) => return Ok(StreamEnd::Stopped),
            };

            match next {
                Err(_elapsed) => {
                    self.state = SupervisorState::Stalled;
                    return Err(StreamError::Stalled {
                        idle_ms: self.config.stale_timeout_ms,
                    }
                    .into());
                }
                Ok(None) => {
                    self.state = SupervisorState::Erroring;
                    return Err(StreamError::Closed.into());
                }
                Ok(Some(Err(e))) => {
                    self.state = SupervisorState::Erroring;
                    return Err(e.into());
                }
                Ok(Some(Ok(message))) => {
                    self.note_message(&message);
                    pipeline.ingest(message).await?;
                }
            }
        }
    }

    fn note_message(&mut self, message: &StreamMessage) {
        if self.state != SupervisorState::Streaming {
            self.state = SupervisorState::Streaming;
            self.streaming_since = Some(Instant::now());
        }
        self.packets_received += 1;
        self.last_packet_at = Some(Instant::now());
        match message {
            StreamMessage::Chunk(_) => self.chunks_received += 1,
            StreamMessage::Pose(_) => self.poses_received += 1,
        }

        // Only a sustained healthy stream forgives earlier failures.
        if self.consecutive_failures > 0
            && self
                .streaming_since
                .is_some_and(|t| t.elapsed() >= self.config.retry_reset_after())
        {
            debug!(
                forgiven = self.consecutive_failures,
                "sustained streaming, retry counter reset"
            );
            self.consecutive_failures = 0;
        }
    }

    fn log_decision(&self, decision: &SessionDecision) {
        match decision {
            SessionDecision::Continue { descriptor } => {
                info!(session_id = %descriptor.session_id, "resuming session from cache");
            }
            SessionDecision::Reset {
                descriptor,
                cleared_chunks,
            } => {
                info!(
                    session_id = %descriptor.session_id,
                    cleared_chunks,
                    "streaming fresh session"
                );
            }
        }
    }
}
