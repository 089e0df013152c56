pub mod cancel;
pub mod download;
pub mod engine;
pub mod error;
pub mod ping;
pub mod simulation;
pub mod upload;

pub use cancel::CancellationToken;
pub use engine::Engine;
pub use error::ProbeError;

use reqwest::{header, Client, RequestBuilder};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper clamp for every reported rate, in Mbps.
pub const MAX_SPEED_MBPS: f64 = 1000.0;

/// Minimum interval between two progress notifications of a throughput probe.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Connection ramp-up window excluded from live rate reporting.
pub const WARMUP: Duration = Duration::from_millis(500);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of everything the engine measures. Observers only ever see copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub ping_ms: u32,
    pub jitter_ms: u32,
    pub progress_percent: f64,
}

impl MetricsSnapshot {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[cfg(test)]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn set_speed(&mut self, direction: Direction, mbps: f64) {
        match direction {
            Direction::Download => self.download_speed_mbps = mbps,
            Direction::Upload => self.upload_speed_mbps = mbps,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TestState {
    #[default]
    Idle,
    Connecting,
    Download,
    Upload,
    Complete,
    Error,
}

impl TestState {
    /// States from which a new run may begin.
    pub fn accepts_start(self) -> bool {
        matches!(self, TestState::Idle | TestState::Complete | TestState::Error)
    }

    pub fn is_running(self) -> bool {
        matches!(self, TestState::Connecting | TestState::Download | TestState::Upload)
    }

    pub fn label(self) -> &'static str {
        match self {
            TestState::Idle => "Ready",
            TestState::Connecting => "Measuring latency...",
            TestState::Download => "Testing download...",
            TestState::Upload => "Testing upload...",
            TestState::Complete => "Complete",
            TestState::Error => "Test failed",
        }
    }
}

/// Transfer direction of a throughput phase.
///
/// Download owns the first half of overall progress, upload the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    /// Maps a completion fraction of this phase onto overall progress.
    pub fn progress(self, fraction: f64) -> f64 {
        match self {
            Direction::Download => (fraction * 50.0).min(50.0),
            Direction::Upload => 50.0 + fraction * 50.0,
        }
    }
}

/// Bits-per-second rate in Mbps, clamped to [`MAX_SPEED_MBPS`] and rounded
/// to two decimals.
pub fn speed_mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    let mbps = (bytes as f64 * 8.0) / secs / 1_000_000.0;
    round2(mbps.min(MAX_SPEED_MBPS))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn http_client() -> Result<Client, ProbeError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(ProbeError::Client)
}

/// Adds a per-attempt query parameter and disables intermediary caching.
pub(crate) fn no_store(request: RequestBuilder) -> RequestBuilder {
    request
        .query(&[("t", cache_buster())])
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::PRAGMA, "no-cache")
}

fn cache_buster() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    nanos.to_string()
}
