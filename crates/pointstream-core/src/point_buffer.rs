//! Append-only point arena with a bounded reservoir index.
//!
//! The buffer owns a fixed-capacity arena of positions and colors and a
//! monotonic write cursor. It is the in-memory projection of the chunk
//! store's ordered contents, never the source of truth: it is rebuilt
//! from the store on session change and discarded on teardown.
//!
//! # Reservoir
//!
//! Alongside the arena the buffer keeps a bounded sample of arena indices
//! for secondary (picking) use. Each appended point is included with a
//! fixed independent probability `p` until the cap is reached, after
//! which sampling stops. This is a first-come bounded reservoir, not a
//! uniform reservoir over the whole stream; once the cap is hit, earlier
//! points are favored. The downstream picker only needs *some* well
//! spread indices, so the simpler policy wins.

/// A contiguous range of appended points: `offset` and `count` are in
/// points, not floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendRange {
    pub offset: usize,
    pub count: usize,
}

impl AppendRange {
    /// Whether the range covers no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Bounded Bernoulli sample of arena indices.
#[derive(Debug)]
pub struct ReservoirIndex {
    indices: Vec<usize>,
    ratio: f64,
    max_size: usize,
    /// SplitMix64 state; seedable so sampling tests are deterministic.
    rng_state: u64,
    seed: u64,
}

impl ReservoirIndex {
    #[must_use]
    pub fn new(ratio: f64, max_size: usize) -> Self {
        Self::with_seed(ratio, max_size, 0x5DEE_CE66_D1A4_F87D)
    }

    #[must_use]
    pub fn with_seed(ratio: f64, max_size: usize, seed: u64) -> Self {
        Self {
            indices: Vec::new(),
            ratio: ratio.clamp(0.0, 1.0),
            max_size,
            rng_state: seed,
            seed,
        }
    }

    /// Offer one arena index to the sample.
    fn offer(&mut self, index: usize) {
        if self.indices.len() >= self.max_size {
            return;
        }
        if self.next_f64() < self.ratio {
            self.indices.push(index);
        }
    }

    /// Current sampled indices, ascending by construction.
    #[must_use]
    pub fn snapshot(&self) -> &[usize] {
        &self.indices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.rng_state = self.seed;
    }

    /// SplitMix64 pseudo-random number generator.
    fn next_u64(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Fixed-capacity append-only arena of positions and colors.
///
/// `write_index` is monotonically non-decreasing for the lifetime of one
/// buffer instance; there is no wraparound. A new session gets a fresh
/// (reset) buffer.
pub struct AppendOnlyPointBuffer {
    positions: Vec<f32>,
    colors: Vec<f32>,
    capacity: usize,
    write_index: usize,
    flush_mark: usize,
    reservoir: ReservoirIndex,
}

impl AppendOnlyPointBuffer {
    /// Create a buffer holding at most `capacity` points.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize, reservoir_ratio: f64, max_reservoir_size: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            positions: vec![0.0; capacity * 3],
            colors: vec![0.0; capacity * 3],
            capacity,
            write_index: 0,
            flush_mark: 0,
            reservoir: ReservoirIndex::new(reservoir_ratio, max_reservoir_size),
        }
    }

    /// Replace the reservoir with a seeded one (tests).
    #[cfg(test)]
    pub(crate) fn with_reservoir_seed(mut self, seed: u64) -> Self {
        let ratio = self.reservoir.ratio;
        let max = self.reservoir.max_size;
        self.reservoir = ReservoirIndex::with_seed(ratio, max, seed);
        self
    }

    /// Append `coords`/`colors` (flat xyz/rgb triplets) to the arena.
    ///
    /// On success the points live at `[write_index, write_index + count)`
    /// and each is offered to the reservoir. Fails with
    /// [`crate::Error::CapacityExceeded`] without touching any state when
    /// the arena cannot hold the points; the caller decides whether to
    /// drop, truncate, or abort.
    pub fn append(&mut self, coords: &[f32], colors: &[f32]) -> crate::Result<AppendRange> {
        if coords.len() != colors.len() || coords.len() % 3 != 0 {
            return Err(crate::error::DecodeError::LengthMismatch {
                chunk_id: String::new(),
                coords: coords.len(),
                colors: colors.len(),
            }
            .into());
        }

        let count = coords.len() / 3;
        if self.write_index + count > self.capacity {
            return Err(crate::Error::CapacityExceeded {
                requested: count,
                write_index: self.write_index,
                capacity: self.capacity,
            });
        }

        let start = self.write_index * 3;
        self.positions[start..start + coords.len()].copy_from_slice(coords);
        self.colors[start..start + colors.len()].copy_from_slice(colors);

        for i in 0..count {
            self.reservoir.offer(self.write_index + i);
        }

        let range = AppendRange {
            offset: self.write_index,
            count,
        };
        // Advance only after the copy completed, so a cancelled or failed
        // append can never expose partially written points.
        self.write_index += count;
        Ok(range)
    }

    /// Range appended since the last flush; the renderer uploads exactly
    /// this window.
    pub fn flush(&mut self) -> AppendRange {
        let range = AppendRange {
            offset: self.flush_mark,
            count: self.write_index - self.flush_mark,
        };
        self.flush_mark = self.write_index;
        range
    }

    /// Zero the cursor and the reservoir. Used only on session change.
    pub fn reset(&mut self) {
        self.write_index = 0;
        self.flush_mark = 0;
        self.reservoir.clear();
    }

    /// Sampled arena indices for the picking collaborator.
    #[must_use]
    pub fn reservoir_snapshot(&self) -> &[usize] {
        self.reservoir.snapshot()
    }

    /// Written prefix of the position arena (3 floats per point).
    #[must_use]
    pub fn positions(&self) -> &[f32] {
        &self.positions[..self.write_index * 3]
    }

    /// Written prefix of the color arena (3 floats per point).
    #[must_use]
    pub fn colors(&self) -> &[f32] {
        &self.colors[..self.write_index * 3]
    }

    #[must_use]
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points the arena can still accept.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.write_index
    }
}

impl std::fmt::Debug for AppendOnlyPointBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendOnlyPointBuffer")
            .field("capacity", &self.capacity)
            .field("write_index", &self.write_index)
            .field("flush_mark", &self.flush_mark)
            .field("reservoir_len", &self.reservoir.len())
            .finish()
    }
}
