use super::engine::PhaseHandle;
use super::{no_store, speed_mbps, Direction, ProbeError, UPDATE_INTERVAL, WARMUP};
use futures::StreamExt;
use reqwest::{Client, Url};
use tokio::time::Instant;
use tracing::debug;

/// Payload requested from the download endpoint.
pub const DOWNLOAD_SIZE: u64 = 25_000_000;

/// Bytes after which the connection counts as warmed up even if
/// [`WARMUP`] has not elapsed yet.
pub const WARMUP_BYTES: u64 = 1_000_000;

const MIN_ELAPSED_SECS: f64 = 0.1;

pub struct DownloadProbe {
    download_size: u64,
}

impl DownloadProbe {
    pub fn new() -> Self {
        Self {
            download_size: DOWNLOAD_SIZE,
        }
    }

    pub async fn run(
        &mut self,
        client: &Client,
        url: &Url,
        phase: &PhaseHandle,
    ) -> Result<DownloadResult, ProbeError> {
        let request = no_store(client.get(url.clone()).query(&[("bytes", self.download_size)]));
        debug!(url = %url, bytes = self.download_size, "starting download");

        let response = tokio::select! {
            biased;
            _ = phase.token().cancelled() => return Err(ProbeError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }
        if response.content_length() == Some(0) {
            return Err(ProbeError::EmptyBody);
        }

        let mut meter = DownloadMeter::new(self.download_size, Instant::now());
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = phase.token().cancelled() => return Err(ProbeError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;

            if let Some(sample) = meter.on_chunk(chunk.len(), Instant::now()) {
                phase.publish(|metrics| {
                    metrics.download_speed_mbps = sample.speed_mbps;
                    metrics.progress_percent = sample.progress_percent;
                })?;
            }
        }

        let avg_speed = meter.finish(Instant::now());
        phase.publish(|metrics| metrics.download_speed_mbps = avg_speed)?;
        debug!(
            bytes = meter.received(),
            warmed_up = meter.warmed_up(),
            mbps = avg_speed,
            "download finished"
        );

        Ok(DownloadResult {
            avg_speed_mbps: avg_speed,
        })
    }
}

/// Turns a stream of chunk arrivals into rate samples.
///
/// Live samples exclude the warmup interval; the final rate does not.
#[derive(Debug)]
pub struct DownloadMeter {
    total_bytes: u64,
    received: u64,
    start: Instant,
    last_update: Instant,
    warmup: Option<Warmup>,
}

#[derive(Debug, Clone, Copy)]
struct Warmup {
    bytes: u64,
    at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadSample {
    pub speed_mbps: f64,
    pub progress_percent: f64,
}

impl DownloadMeter {
    pub fn new(total_bytes: u64, start: Instant) -> Self {
        Self {
            total_bytes,
            received: 0,
            start,
            last_update: start,
            warmup: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn warmed_up(&self) -> bool {
        self.warmup.is_some()
    }

    /// Records a chunk; returns a sample when one is due.
    pub fn on_chunk(&mut self, len: usize, now: Instant) -> Option<DownloadSample> {
        self.received += len as u64;
        let elapsed = now.saturating_duration_since(self.start);

        if self.warmup.is_none() && (elapsed > WARMUP || self.received > WARMUP_BYTES) {
            self.warmup = Some(Warmup {
                bytes: self.received,
                at: now,
            });
        }

        if now.saturating_duration_since(self.last_update) < UPDATE_INTERVAL {
            return None;
        }
        self.last_update = now;

        let speed_mbps = match self.warmup {
            Some(warmup) => speed_mbps(
                self.received - warmup.bytes,
                now.saturating_duration_since(warmup.at).as_secs_f64(),
            ),
            None => speed_mbps(self.received, elapsed.as_secs_f64().max(MIN_ELAPSED_SECS)),
        };

        Some(DownloadSample {
            speed_mbps,
            progress_percent: Direction::Download
                .progress(self.received as f64 / self.total_bytes as f64),
        })
    }

    /// Average rate over the whole transfer, warmup included.
    pub fn finish(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        speed_mbps(self.received, elapsed.max(MIN_ELAPSED_SECS))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub avg_speed_mbps: f64,
}
