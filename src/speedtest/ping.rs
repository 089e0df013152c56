use super::engine::PhaseHandle;
use super::{no_store, ProbeError};
use reqwest::{Client, Url};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Round-trips issued per run.
pub const LATENCY_ATTEMPTS: usize = 5;

/// Reported when no round-trip succeeded.
pub const FALLBACK_PING_MS: u32 = 50;
pub const FALLBACK_JITTER_MS: u32 = 10;

pub struct LatencyProbe {
    samples: Vec<f64>,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(LATENCY_ATTEMPTS),
        }
    }

    /// Issues the round-trips one after another and publishes ping and
    /// jitter once all of them resolved. Individual failures are skipped.
    pub async fn run(
        &mut self,
        client: &Client,
        url: &Url,
        phase: &PhaseHandle,
    ) -> Result<LatencyResult, ProbeError> {
        self.samples.clear();

        for attempt in 0..LATENCY_ATTEMPTS {
            phase.check()?;

            let request = no_store(client.get(url.clone()));
            let start = Instant::now();
            let response = tokio::select! {
                biased;
                _ = phase.token().cancelled() => return Err(ProbeError::Cancelled),
                response = request.send() => response,
            };

            match response {
                Ok(_) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    debug!(attempt, elapsed_ms = elapsed, "latency sample");
                    self.record(elapsed);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "latency request failed");
                }
            }
        }

        let result = self.calculate_result();
        phase.publish(|metrics| {
            metrics.ping_ms = result.ping_ms;
            metrics.jitter_ms = result.jitter_ms;
        })?;
        Ok(result)
    }

    fn record(&mut self, elapsed_ms: f64) {
        if elapsed_ms > 0.0 {
            self.samples.push(elapsed_ms);
        }
    }

    fn calculate_result(&self) -> LatencyResult {
        LatencyResult::from_samples(&self.samples)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyResult {
    pub ping_ms: u32,
    pub jitter_ms: u32,
}

impl LatencyResult {
    /// Ping is the fastest sample; jitter is the largest absolute deviation
    /// of any sample from the mean.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                ping_ms: FALLBACK_PING_MS,
                jitter_ms: FALLBACK_JITTER_MS,
            };
        }

        let min = samples.iter().copied().fold(f64::MAX, f64::min);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let jitter = samples
            .iter()
            .map(|&s| (s - mean).abs())
            .fold(0.0, f64::max);

        Self {
            ping_ms: to_ms(min),
            jitter_ms: to_ms(jitter),
        }
    }
}

fn to_ms(value: f64) -> u32 {
    value.round().max(0.0) as u32
}
