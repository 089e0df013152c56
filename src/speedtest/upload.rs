use super::engine::PhaseHandle;
use super::{no_store, speed_mbps, Direction, ProbeError, UPDATE_INTERVAL, WARMUP};
use bytes::Bytes;
use futures::{stream, StreamExt};
use rand::Rng;
use reqwest::{header, Body, Client, Url};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Size of the generated upload payload.
pub const UPLOAD_SIZE: usize = 5_000_000;

pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

const CHUNK_SIZE: usize = 64 * 1024;
const MIN_ELAPSED_SECS: f64 = 0.1;

pub struct UploadProbe {
    data: Bytes,
    timeout: Duration,
}

impl UploadProbe {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut data = vec![0u8; UPLOAD_SIZE];
        rng.fill_bytes(&mut data);
        Self {
            data: Bytes::from(data),
            timeout: UPLOAD_TIMEOUT,
        }
    }

    /// Posts the payload as a single request. Progress events are raised as
    /// the transport pulls each chunk of the body.
    pub async fn run(
        &mut self,
        client: &Client,
        url: &Url,
        phase: &PhaseHandle,
    ) -> Result<UploadResult, ProbeError> {
        phase.check()?;
        let total = self.data.len() as u64;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();

        let chunks: Vec<Bytes> = (0..self.data.len())
            .step_by(CHUNK_SIZE)
            .map(|offset| self.data.slice(offset..(offset + CHUNK_SIZE).min(self.data.len())))
            .collect();
        let mut sent = 0u64;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            let _ = progress_tx.send(sent);
            Ok::<_, std::io::Error>(chunk)
        });

        let request = no_store(client.post(url.clone()))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, total)
            .body(Body::wrap_stream(body));
        debug!(url = %url, bytes = total, "starting upload");

        let start = Instant::now();
        let mut meter = UploadMeter::new(total, start);
        let send = request.send();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(send, deadline);

        let response = loop {
            tokio::select! {
                biased;
                _ = phase.token().cancelled() => return Err(ProbeError::Cancelled),
                _ = &mut deadline => return Err(ProbeError::Timeout(self.timeout)),
                Some(sent) = progress_rx.recv() => {
                    if let Some(sample) = meter.on_progress(sent, Instant::now()) {
                        phase.publish(|metrics| {
                            metrics.upload_speed_mbps = sample.speed_mbps;
                            metrics.progress_percent = sample.progress_percent;
                        })?;
                    }
                }
                response = &mut send => break response?,
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }

        let avg_speed = meter.finish(Instant::now());
        phase.publish(|metrics| metrics.upload_speed_mbps = avg_speed)?;
        debug!(mbps = avg_speed, "upload finished");

        Ok(UploadResult {
            avg_speed_mbps: avg_speed,
        })
    }
}

/// Rate samples for the upload direction.
///
/// Events inside the warmup window are dropped, but rates are always
/// computed over the time since the absolute start.
#[derive(Debug)]
pub struct UploadMeter {
    total_bytes: u64,
    start: Instant,
    last_update: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadSample {
    pub speed_mbps: f64,
    pub progress_percent: f64,
}

impl UploadMeter {
    pub fn new(total_bytes: u64, start: Instant) -> Self {
        Self {
            total_bytes,
            start,
            last_update: start,
        }
    }

    pub fn on_progress(&mut self, bytes_sent: u64, now: Instant) -> Option<UploadSample> {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed <= WARMUP {
            return None;
        }
        if now.saturating_duration_since(self.last_update) < UPDATE_INTERVAL {
            return None;
        }
        self.last_update = now;

        Some(UploadSample {
            speed_mbps: speed_mbps(bytes_sent, elapsed.as_secs_f64()),
            progress_percent: Direction::Upload
                .progress(bytes_sent as f64 / self.total_bytes as f64),
        })
    }

    pub fn finish(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        speed_mbps(self.total_bytes, elapsed.max(MIN_ELAPSED_SECS))
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub avg_speed_mbps: f64,
}
