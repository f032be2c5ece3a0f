//! Session reconciliation: replay the cache or discard it.
//!
//! Before any chunk is accepted from a new stream, the reconciler
//! compares the last cached [`SessionDescriptor`] against the server's
//! current one and produces one of two outcomes:
//!
//! - [`SessionDecision::Continue`] — same session; cached chunks may be
//!   replayed into the buffer and the server may skip redelivery.
//! - [`SessionDecision::Reset`] — no cache, or the server session
//!   changed (new id, new start time, or the server marked the session
//!   inactive). The stale session's chunks and poses are cleared, the
//!   new descriptor is persisted, and a fresh stream from sequence 0 is
//!   expected.
//!
//! A session-query timeout, or a descriptor with an empty session id,
//! means the server has no session available yet. Both are transient:
//! the supervisor retries, nothing is cleared.
//!
//! Running exactly once per connection attempt is what keeps chunks from
//! two sessions out of one buffer; the supervisor holds ingestion until
//! the decision lands.

use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, info};

use crate::chunk::{CacheState, SessionDescriptor};
use crate::chunk_store::ChunkStore;
use crate::error::{Error, Result};
use crate::transport::ChunkTransport;

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// Cached and server sessions match; replay the cache.
    Continue { descriptor: SessionDescriptor },
    /// Fresh session; the cache for the previous session was cleared.
    Reset {
        descriptor: SessionDescriptor,
        cleared_chunks: usize,
    },
}

impl SessionDecision {
    /// The server descriptor this decision was made against.
    #[must_use]
    pub fn descriptor(&self) -> &SessionDescriptor {
        match self {
            SessionDecision::Continue { descriptor }
            | SessionDecision::Reset { descriptor, .. } => descriptor,
        }
    }

    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self, SessionDecision::Reset { .. })
    }
}

/// Fetch the server session (bounded by `query_timeout`) and reconcile
/// it against the store's cached descriptor.
pub async fn reconcile<T: ChunkTransport>(
    store: &ChunkStore,
    transport: &mut T,
    query_timeout: Duration,
) -> Result<SessionDecision> {
    let started = Instant::now();
    let current = match timeout(query_timeout, transport.session_info()).await {
        Ok(Ok(descriptor)) => descriptor,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(Error::SessionQueryTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
    };

    if !current.is_available() {
        // The server answered but has no session yet. Same transient
        // handling as a timeout; never a reason to clear the cache.
        debug!("server returned an empty session descriptor");
        return Err(Error::SessionQueryTimeout {
            waited_ms: started.elapsed().as_millis() as u64,
        });
    }

    let cached = store.load_session()?;

    let decision = match cached {
        Some(prev)
            if prev.session_id == current.session_id
                && prev.start_time == current.start_time
                && current.is_active =>
        {
            info!(session_id = %current.session_id, "session unchanged, cache is valid");
            SessionDecision::Continue { descriptor: current }
        }
        Some(prev) => {
            let cleared = store.clear_session(&prev.session_id)?;
            store.save_session(&current)?;
            info!(
                old_session = %prev.session_id,
                new_session = %current.session_id,
                cleared_chunks = cleared,
                "session changed, cache discarded"
            );
            SessionDecision::Reset {
                descriptor: current,
                cleared_chunks: cleared,
            }
        }
        None => {
            store.save_session(&current)?;
            info!(session_id = %current.session_id, "no cached session, starting fresh");
            SessionDecision::Reset {
                descriptor: current,
                cleared_chunks: 0,
            }
        }
    };

    Ok(decision)
}

/// Advisory cache-state metadata for the stream-open request.
pub fn cache_state(store: &ChunkStore, session_id: &str) -> Result<CacheState> {
    let last_sequence = store.max_sequence(session_id)?;
    let chunk_count = store.get_by_session(session_id)?.len() as u64;
    Ok(CacheState {
        session_id: Some(session_id.to_string()),
        last_sequence,
        chunk_count,
    })
}
