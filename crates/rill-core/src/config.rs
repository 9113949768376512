//! Pipeline tuning knobs.
//!
//! Loaded from TOML with sensible defaults; every field falls back to the
//! defaults the original widget shipped with, so an empty file is a valid
//! configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Drain cadence for the character buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Drain tick period in milliseconds.
    pub tick_ms: u64,
    /// Queue length below which one character is released per tick.
    pub small_queue: usize,
    /// Queue length past which the batch grows toward `max_batch`.
    pub large_queue: usize,
    /// Cap on characters released per channel per tick.
    pub max_batch: usize,
    /// Consecutive no-progress ticks (with a non-empty queue) before an
    /// emergency release fires.
    pub stall_ticks: u32,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            small_queue: 24,
            large_queue: 200,
            max_batch: 16,
            stall_ticks: 2,
        }
    }
}

impl CadenceConfig {
    /// Faster variant used when regenerating a message, where the user has
    /// already seen the typing animation once.
    pub fn regeneration(mut self) -> Self {
        self.tick_ms = self.tick_ms.min(25);
        self.max_batch = self.max_batch.saturating_mul(2);
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Bounded retry policy parameters for transport failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum reconnect attempts before surfacing a terminal error.
    pub max_attempts: u32,
    /// Linear backoff step in milliseconds (attempt N waits N * step).
    pub backoff_step_ms: u64,
    /// Seconds without genuine progress before a retry-or-fail decision.
    pub inactivity_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 1000,
            inactivity_timeout_secs: 5,
        }
    }
}

impl RetryConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// Diagram queue and cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagramConfig {
    /// Absolute wait budget per diagram job in milliseconds; the only
    /// authority that can force a job out of `Queued` early.
    pub render_deadline_ms: u64,
    /// Bound on the rendered-graphic cache.
    pub cache_capacity: usize,
    /// Theme key mixed into cache lookups (e.g. "dark", "light").
    pub theme: String,
}

impl Default for DiagramConfig {
    fn default() -> Self {
        Self {
            render_deadline_ms: 8000,
            cache_capacity: 64,
            theme: "dark".to_string(),
        }
    }
}

impl DiagramConfig {
    pub fn render_deadline(&self) -> Duration {
        Duration::from_millis(self.render_deadline_ms)
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cadence: CadenceConfig,
    pub retry: RetryConfig,
    pub diagram: DiagramConfig,
    /// Marker appended to the answer channel when the user stops a turn.
    pub stop_marker: String,
}

impl Config {
    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }
}

impl Config {
    pub fn stop_marker(&self) -> &str {
        if self.stop_marker.is_empty() {
            DEFAULT_STOP_MARKER
        } else {
            &self.stop_marker
        }
    }
}

const DEFAULT_STOP_MARKER: &str = "\n\n*stopped by user*";
