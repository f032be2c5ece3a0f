//! Durable chunk cache on SQLite.
//!
//! Three tables back the store:
//!
//! - `chunks` — decoded chunks keyed by `chunk_id`, with a secondary
//!   index on `session_id` and a unique composite index on
//!   `(session_id, sequence_number)`. Coordinates and colors are stored
//!   as little-endian f32 blobs.
//! - `poses` — cached camera poses, keyed by `(session_id,
//!   trajectory_index)`.
//! - `session_info` — singleton row holding the last-seen
//!   [`SessionDescriptor`].
//!
//! `put` uses `INSERT OR IGNORE`, so redelivery of a chunk id (or of a
//! `(session, sequence)` pair under a new id) is a no-op write rather
//! than an error; idempotent ingestion falls out of the schema.
//!
//! The connection sits behind a mutex: callers see `&self` methods and
//! the pipeline's single orchestration task keeps writes naturally
//! sequenced.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::{Chunk, PoseRecord, SessionDescriptor};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id        TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    timestamp_ms    INTEGER NOT NULL,
    point_count     INTEGER NOT NULL,
    coords          BLOB NOT NULL,
    colors          BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_session ON chunks(session_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_session_seq
    ON chunks(session_id, sequence_number);

CREATE TABLE IF NOT EXISTS poses (
    session_id       TEXT NOT NULL,
    trajectory_index INTEGER NOT NULL,
    matrix           BLOB NOT NULL,
    position         BLOB NOT NULL,
    timestamp_ms    INTEGER NOT NULL,
    PRIMARY KEY (session_id, trajectory_index)
);

CREATE TABLE IF NOT EXISTS session_info (
    key               TEXT PRIMARY KEY CHECK (key = 'current'),
    session_id        TEXT NOT NULL,
    start_time        INTEGER NOT NULL,
    is_active         INTEGER NOT NULL,
    clients_connected INTEGER NOT NULL
);
";

/// Aggregate view of the cache contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_chunks: u64,
    pub total_points: u64,
    pub sessions: BTreeSet<String>,
    pub oldest_timestamp_ms: Option<u64>,
    pub newest_timestamp_ms: Option<u64>,
    /// Payload blob bytes; excludes SQLite page overhead.
    pub approximate_byte_size: u64,
}

/// Durable key-value store of decoded chunks and poses.
pub struct ChunkStore {
    conn: Mutex<Connection>,
}

impl ChunkStore {
    /// Open (or create) a store at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    /// Open an in-memory store. Used by tests and by hosts that want the
    /// cache semantics without durability.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether a chunk with this id has already been stored.
    pub fn exists(&self, chunk_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a chunk; a second call with the same identity is a no-op.
    ///
    /// Returns `true` when a row was actually written.
    pub fn put(&self, chunk: &Chunk) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO chunks
                 (chunk_id, session_id, sequence_number, timestamp_ms,
                  point_count, coords, colors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.chunk_id,
                chunk.session_id,
                chunk.sequence_number,
                chunk.timestamp_ms,
                chunk.point_count() as u64,
                f32s_to_blob(&chunk.coords),
                f32s_to_blob(&chunk.colors),
            ],
        )?;
        if changed == 0 {
            debug!(chunk_id = %chunk.chunk_id, "duplicate chunk ignored by store");
        }
        Ok(changed > 0)
    }

    /// All chunks ordered by sequence number ascending, ties broken by
    /// insertion order. Rows that fail integrity checks are skipped and
    /// logged, never returned and never fatal.
    pub fn get_all_ordered(&self) -> Result<Vec<Chunk>, StoreError> {
        self.query_chunks(
            "SELECT chunk_id, session_id, sequence_number, timestamp_ms, coords, colors
             FROM chunks ORDER BY sequence_number ASC, rowid ASC",
            params![],
        )
    }

    /// Chunks for one session, sequence order.
    pub fn get_by_session(&self, session_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.query_chunks(
            "SELECT chunk_id, session_id, sequence_number, timestamp_ms, coords, colors
             FROM chunks WHERE session_id = ?1 ORDER BY sequence_number ASC, rowid ASC",
            params![session_id],
        )
    }

    fn query_chunks(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        // A corrupt row is skipped, not fatal: a cache read that fails
        // wholesale would block every future startup on one bad record.
        let mut chunks = Vec::new();
        for row in rows {
            let (chunk_id, session_id, sequence_number, timestamp_ms, coords, colors) = row?;
            let coords = match blob_to_f32s(&chunk_id, &coords) {
                Ok(values) => values,
                Err(e) => {
                    warn!(chunk_id, error = %e, "skipping corrupt cached chunk");
                    continue;
                }
            };
            let colors = match blob_to_f32s(&chunk_id, &colors) {
                Ok(values) => values,
                Err(e) => {
                    warn!(chunk_id, error = %e, "skipping corrupt cached chunk");
                    continue;
                }
            };
            if coords.len() != colors.len() || coords.len() % 3 != 0 {
                warn!(
                    chunk_id,
                    coords = coords.len(),
                    colors = colors.len(),
                    "skipping cached chunk with mismatched arrays"
                );
                continue;
            }
            chunks.push(Chunk {
                chunk_id,
                session_id,
                sequence_number,
                timestamp_ms,
                coords,
                colors,
            });
        }
        Ok(chunks)
    }

    /// Highest sequence number stored for a session, if any. Feeds the
    /// advisory cache-state metadata sent when opening a stream.
    pub fn max_sequence(&self, session_id: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let max: Option<u64> = conn.query_row(
            "SELECT MAX(sequence_number) FROM chunks WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Remove every chunk and pose belonging to `session_id`; returns the
    /// number of chunks removed.
    pub fn clear_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let conn = self.lock();
        let chunks = conn.execute(
            "DELETE FROM chunks WHERE session_id = ?1",
            params![session_id],
        )?;
        conn.execute(
            "DELETE FROM poses WHERE session_id = ?1",
            params![session_id],
        )?;
        debug!(session_id, removed = chunks, "cleared session from store");
        Ok(chunks)
    }

    /// Aggregate statistics over the whole store.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock();
        let (total_chunks, total_points, oldest, newest, bytes): (
            u64,
            Option<u64>,
            Option<u64>,
            Option<u64>,
            Option<u64>,
        ) = conn.query_row(
            "SELECT COUNT(*), SUM(point_count), MIN(timestamp_ms), MAX(timestamp_ms),
                    SUM(LENGTH(coords) + LENGTH(colors))
             FROM chunks",
            params![],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare("SELECT DISTINCT session_id FROM chunks")?;
        let sessions = stmt
            .query_map(params![], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(StoreStats {
            total_chunks,
            total_points: total_points.unwrap_or(0),
            sessions,
            oldest_timestamp_ms: oldest,
            newest_timestamp_ms: newest,
            approximate_byte_size: bytes.unwrap_or(0),
        })
    }

    // -- session descriptor ---------------------------------------------------

    /// Last-seen session descriptor, if one was persisted.
    pub fn load_session(&self) -> Result<Option<SessionDescriptor>, StoreError> {
        let conn = self.lock();
        let descriptor = conn
            .query_row(
                "SELECT session_id, start_time, is_active, clients_connected
                 FROM session_info WHERE key = 'current'",
                params![],
                |row| {
                    Ok(SessionDescriptor {
                        session_id: row.get(0)?,
                        start_time: row.get(1)?,
                        is_active: row.get::<_, i64>(2)? != 0,
                        clients_connected: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(descriptor)
    }

    /// Persist the session descriptor, replacing any previous one.
    pub fn save_session(&self, descriptor: &SessionDescriptor) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_info
                 (key, session_id, start_time, is_active, clients_connected)
             VALUES ('current', ?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 session_id = excluded.session_id,
                 start_time = excluded.start_time,
                 is_active = excluded.is_active,
                 clients_connected = excluded.clients_connected",
            params![
                descriptor.session_id,
                descriptor.start_time,
                descriptor.is_active as i64,
                descriptor.clients_connected,
            ],
        )?;
        Ok(())
    }

    // -- poses ------------------------------------------------------------------

    /// Insert a pose; idempotent on `(session_id, trajectory_index)`.
    pub fn put_pose(&self, pose: &PoseRecord) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO poses
                 (session_id, trajectory_index, matrix, position, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pose.session_id,
                pose.trajectory_index,
                f32s_to_blob(&pose.matrix),
                f32s_to_blob(&pose.position),
                pose.timestamp_ms,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Poses for one session ordered by trajectory index.
    pub fn poses_by_session(&self, session_id: &str) -> Result<Vec<PoseRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT trajectory_index, matrix, position, timestamp_ms
             FROM poses WHERE session_id = ?1 ORDER BY trajectory_index ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, u64>(3)?,
            ))
        })?;

        let mut poses = Vec::new();
        for row in rows {
            let (trajectory_index, matrix_blob, position_blob, timestamp_ms) = row?;
            let matrix_vec = blob_to_f32s("pose", &matrix_blob)?;
            let position_vec = blob_to_f32s("pose", &position_blob)?;
            let matrix: [f32; 16] =
                matrix_vec
                    .try_into()
                    .map_err(|v: Vec<f32>| StoreError::Corruption {
                        chunk_id: format!("pose:{trajectory_index}"),
                        details: format!("matrix has {} values, expected 16", v.len()),
                    })?;
            let position: [f32; 3] =
                position_vec
                    .try_into()
                    .map_err(|v: Vec<f32>| StoreError::Corruption {
                        chunk_id: format!("pose:{trajectory_index}"),
                        details: format!("position has {} values, expected 3", v.len()),
                    })?;
            poses.push(PoseRecord {
                session_id: session_id.to_string(),
                trajectory_index,
                matrix,
                position,
                timestamp_ms,
            });
        }
        Ok(poses)
    }
}

fn f32s_to_blob(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_f32s(chunk_id: &str, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corruption {
            chunk_id: chunk_id.to_string(),
            details: format!("blob length {} is not a multiple of 4", blob.len()),
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, session: &str, seq: u64, points: usize) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            sequence_number: seq,
            session_id: session.to_string(),
            timestamp_ms: 1000 + seq,
            coords: (0..points * 3).map(|i| i as f32).collect(),
            colors: (0..points * 3).map(|i| i as f32 / 255.0).collect(),
        }
    }

    fn pose(session: &str, idx: u64) -> PoseRecord {
        PoseRecord {
            session_id: session.to_string(),
            trajectory_index: idx,
            matrix: [0.5; 16],
            position: [1.0, 2.0, 3.0],
            timestamp_ms: 50 + idx,
        }
    }

    #[test]
    fn put_then_exists_then_get() {
        let store = ChunkStore::in_memory().unwrap();
        assert!(!store.exists("c1").unwrap());

        assert!(store.put(&chunk("c1", "s1", 0, 4)).unwrap());
        assert!(store.exists("c1").unwrap());

        let all = store.get_all_ordered().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], chunk("c1", "s1", 0, 4));
    }

    #[test]
    fn put_is_idempotent() {
        let store = ChunkStore::in_memory().unwrap();
        assert!(store.put(&chunk("c1", "s1", 5, 2)).unwrap());
        assert!(!store.put(&chunk("c1", "s1", 5, 2)).unwrap());

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_points, 2);
    }

    #[test]
    fn duplicate_session_sequence_pair_is_ignored() {
        let store = ChunkStore::in_memory().unwrap();
        assert!(store.put(&chunk("c1", "s1", 5, 2)).unwrap());
        // Different id, same (session, sequence): the unique composite
        // index makes this a silent no-op too.
        assert!(!store.put(&chunk("c2", "s1", 5, 2)).unwrap());
        assert_eq!(store.stats().unwrap().total_chunks, 1);
    }

    #[test]
    fn get_all_ordered_sorts_by_sequence_then_insertion() {
        let store = ChunkStore::in_memory().unwrap();
        store.put(&chunk("c3", "s1", 3, 1)).unwrap();
        store.put(&chunk("c1", "s1", 1, 1)).unwrap();
        store.put(&chunk("c2", "s2", 1, 1)).unwrap();

        let ids: Vec<_> = store
            .get_all_ordered()
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        // seq 1 twice: c1 inserted before c2, so insertion order breaks the tie.
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn get_by_session_filters() {
        let store = ChunkStore::in_memory().unwrap();
        store.put(&chunk("a", "s1", 0, 1)).unwrap();
        store.put(&chunk("b", "s2", 0, 1)).unwrap();
        store.put(&chunk("c", "s1", 1, 1)).unwrap();

        let s1 = store.get_by_session("s1").unwrap();
        assert_eq!(s1.len(), 2);
        assert!(s1.iter().all(|c| c.session_id == "s1"));
        assert!(store.get_by_session("nope").unwrap().is_empty());
    }

    #[test]
    fn clear_session_removes_chunks_and_poses() {
        let store = ChunkStore::in_memory().unwrap();
        store.put(&chunk("a", "s1", 0, 1)).unwrap();
        store.put(&chunk("b", "s1", 1, 1)).unwrap();
        store.put(&chunk("c", "s2", 0, 1)).unwrap();
        store.put_pose(&pose("s1", 0)).unwrap();
        store.put_pose(&pose("s2", 0)).unwrap();

        assert_eq!(store.clear_session("s1").unwrap(), 2);
        assert!(store.get_by_session("s1").unwrap().is_empty());
        assert!(store.poses_by_session("s1").unwrap().is_empty());
        assert_eq!(store.get_by_session("s2").unwrap().len(), 1);
        assert_eq!(store.poses_by_session("s2").unwrap().len(), 1);
        assert_eq!(store.clear_session("s1").unwrap(), 0);
    }

    #[test]
    fn max_sequence_per_session() {
        let store = ChunkStore::in_memory().unwrap();
        assert_eq!(store.max_sequence("s1").unwrap(), None);
        store.put(&chunk("a", "s1", 3, 1)).unwrap();
        store.put(&chunk("b", "s1", 7, 1)).unwrap();
        store.put(&chunk("c", "s2", 9, 1)).unwrap();
        assert_eq!(store.max_sequence("s1").unwrap(), Some(7));
    }

    #[test]
    fn stats_aggregates() {
        let store = ChunkStore::in_memory().unwrap();
        let empty = store.stats().unwrap();
        assert_eq!(empty.total_chunks, 0);
        assert_eq!(empty.total_points, 0);
        assert!(empty.sessions.is_empty());
        assert!(empty.oldest_timestamp_ms.is_none());

        store.put(&chunk("a", "s1", 0, 10)).unwrap();
        store.put(&chunk("b", "s2", 1, 5)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_points, 15);
        assert_eq!(stats.sessions.len(), 2);
        assert_eq!(stats.oldest_timestamp_ms, Some(1000));
        assert_eq!(stats.newest_timestamp_ms, Some(1001));
        // 15 points * 3 floats * 4 bytes * 2 blobs
        assert_eq!(stats.approximate_byte_size, 15 * 3 * 4 * 2);
    }

    #[test]
    fn session_descriptor_roundtrip() {
        let store = ChunkStore::in_memory().unwrap();
        assert!(store.load_session().unwrap().is_none());

        let d = SessionDescriptor {
            session_id: "s1".into(),
            start_time: 100,
            is_active: true,
            clients_connected: 3,
        };
        store.save_session(&d).unwrap();
        assert_eq!(store.load_session().unwrap(), Some(d));

        let d2 = SessionDescriptor {
            session_id: "s2".into(),
            start_time: 200,
            is_active: false,
            clients_connected: 0,
        };
        store.save_session(&d2).unwrap();
        // Singleton: the new descriptor replaces the old one.
        assert_eq!(store.load_session().unwrap(), Some(d2));
    }

    #[test]
    fn poses_ordered_and_idempotent() {
        let store = ChunkStore::in_memory().unwrap();
        assert!(store.put_pose(&pose("s1", 2)).unwrap());
        assert!(store.put_pose(&pose("s1", 0)).unwrap());
        assert!(!store.put_pose(&pose("s1", 2)).unwrap());

        let poses = store.poses_by_session("s1").unwrap();
        assert_eq!(poses.len(), 2);
        assert_eq!(poses[0].trajectory_index, 0);
        assert_eq!(poses[1].trajectory_index, 2);
        assert_eq!(poses[1].position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn corrupt_row_is_skipped_on_read() {
        let store = ChunkStore::in_memory().unwrap();
        store.put(&chunk("good", "s1", 0, 2)).unwrap();

        // A row with a truncated coords blob, written behind the API.
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO chunks
                     (chunk_id, session_id, sequence_number, timestamp_ms,
                      point_count, coords, colors)
                 VALUES ('bad', 's1', 1, 1001, 1, X'0000000000', X'000000003F800000')",
                params![],
            )
            .unwrap();
        }

        let all = store.get_all_ordered().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chunk_id, "good");
        assert_eq!(store.get_by_session("s1").unwrap().len(), 1);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = ChunkStore::open(&path).unwrap();
            store.put(&chunk("c1", "s1", 0, 3)).unwrap();
            store
                .save_session(&SessionDescriptor {
                    session_id: "s1".into(),
                    start_time: 42,
                    is_active: true,
                    clients_connected: 1,
                })
                .unwrap();
        }

        let reopened = ChunkStore::open(&path).unwrap();
        assert!(reopened.exists("c1").unwrap());
        assert_eq!(
            reopened.load_session().unwrap().unwrap().session_id,
            "s1"
        );
    }

    #[test]
    fn blob_roundtrip() {
        let values = vec![0.0_f32, -1.5, 3.25, f32::MAX];
        let blob = f32s_to_blob(&values);
        assert_eq!(blob_to_f32s("t", &blob).unwrap(), values);
        assert!(blob_to_f32s("t", &blob[..5]).is_err());
    }
}
