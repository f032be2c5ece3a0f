//! Host-injected configuration.
//!
//! The core has no CLI; the host hands it a [`StreamConfig`], either
//! built in code or loaded from TOML:
//!
//! ```toml
//! [stream]
//! server_url = "http://192.168.51.30:8080"
//! max_points = 20000000
//! reservoir_ratio = 0.01
//! max_reservoir_size = 200000
//! stale_timeout_ms = 5000
//! max_retries = 5
//! backoff_ms = 3000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the ingestion core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Remote sensing service endpoint.
    pub server_url: String,

    /// Point arena capacity (points, not floats).
    pub max_points: usize,

    /// Independent inclusion probability for the picking reservoir.
    pub reservoir_ratio: f64,

    /// Reservoir cap; sampling stops once reached.
    pub max_reservoir_size: usize,

    /// Liveness timeout while streaming: no message for this long means
    /// the stream is stalled.
    pub stale_timeout_ms: u64,

    /// Consecutive connection failures tolerated before aborting.
    pub max_retries: u32,

    /// Initial backoff delay between reconnection attempts.
    pub backoff_ms: u64,

    /// Upper bound for the exponential backoff delay.
    pub backoff_max_ms: u64,

    /// Bounded timeout for the session metadata query.
    pub session_query_timeout_ms: u64,

    /// Streaming must be sustained this long before the retry counter
    /// resets to zero.
    pub retry_reset_after_ms: u64,

    /// Durable cache location; `None` keeps the cache in memory.
    pub db_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            max_points: 20_000_000,
            reservoir_ratio: 0.01,
            max_reservoir_size: 200_000,
            stale_timeout_ms: 5_000,
            max_retries: 5,
            backoff_ms: 3_000,
            backoff_max_ms: 30_000,
            session_query_timeout_ms: 2_000,
            retry_reset_after_ms: 30_000,
            db_path: None,
        }
    }
}

/// Wrapper so the TOML file can use a `[stream]` table.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    stream: StreamConfig,
}

impl StreamConfig {
    /// Parse a `[stream]` table from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        file.stream.validate()?;
        Ok(file.stream)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(Error::Config("server_url must not be empty".into()));
        }
        if self.max_points == 0 {
            return Err(Error::Config("max_points must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.reservoir_ratio) {
            return Err(Error::Config(format!(
                "reservoir_ratio must be within [0, 1], got {}",
                self.reservoir_ratio
            )));
        }
        if self.stale_timeout_ms == 0 {
            return Err(Error::Config("stale_timeout_ms must be > 0".into()));
        }
        if self.backoff_max_ms < self.backoff_ms {
            return Err(Error::Config(format!(
                "backoff_max_ms ({}) must be >= backoff_ms ({})",
                self.backoff_max_ms, self.backoff_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    #[must_use]
    pub fn session_query_timeout(&self) -> Duration {
        Duration::from_millis(self.session_query_timeout_ms)
    }

    #[must_use]
    pub fn retry_reset_after(&self) -> Duration {
        Duration::from_millis(self.retry_reset_after_ms)
    }
}
