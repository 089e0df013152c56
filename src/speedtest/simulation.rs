//! Synthetic stand-ins for phases whose live probe failed.
//!
//! Values are plausible rather than measured and are published exactly like
//! live samples.

use super::engine::PhaseHandle;
use super::{round2, Direction, ProbeError};
use rand::Rng;
use std::ops::Range;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const LATENCY_DELAY: Duration = Duration::from_millis(600);
pub const RAMP_DURATION: Duration = Duration::from_millis(3000);
pub const RAMP_TICK: Duration = Duration::from_millis(50);

/// Shape parameters of a simulated throughput ramp.
#[derive(Debug, Clone)]
pub struct Ramp {
    pub direction: Direction,
    /// Whole-Mbps range the final rate is drawn from.
    pub target: Range<u32>,
    /// Half-width of the noise added to every tick.
    pub noise: f64,
}

pub const DOWNLOAD_RAMP: Ramp = Ramp {
    direction: Direction::Download,
    target: 60..100,
    noise: 2.5,
};

pub const UPLOAD_RAMP: Ramp = Ramp {
    direction: Direction::Upload,
    target: 20..40,
    noise: 1.0,
};

pub async fn latency<R: Rng + Send>(phase: &PhaseHandle, rng: &mut R) -> Result<(), ProbeError> {
    tokio::select! {
        biased;
        _ = phase.token().cancelled() => return Err(ProbeError::Cancelled),
        _ = sleep(LATENCY_DELAY) => {}
    }
    let ping_ms: u32 = rng.gen_range(15..=34);
    let jitter_ms: u32 = rng.gen_range(0..=4);
    phase.publish(|metrics| {
        metrics.ping_ms = ping_ms;
        metrics.jitter_ms = jitter_ms;
    })
}

/// Eases the published rate towards a random target over
/// [`RAMP_DURATION`], then pins it to exactly that target.
pub async fn ramp<R: Rng + Send>(
    phase: &PhaseHandle,
    ramp: &Ramp,
    rng: &mut R,
) -> Result<f64, ProbeError> {
    let target = f64::from(rng.gen_range(ramp.target.clone()));
    let start = Instant::now();

    loop {
        let elapsed = start.elapsed();
        if elapsed >= RAMP_DURATION {
            break;
        }
        phase.check()?;

        let fraction = elapsed.as_secs_f64() / RAMP_DURATION.as_secs_f64();
        let noise = rng.gen_range(-ramp.noise..ramp.noise);
        let speed = round2((ease_out(target, fraction) + noise).max(0.0));
        phase.publish(|metrics| {
            metrics.set_speed(ramp.direction, speed);
            metrics.progress_percent = ramp.direction.progress(fraction);
        })?;

        sleep(RAMP_TICK).await;
    }

    phase.publish(|metrics| metrics.set_speed(ramp.direction, target))?;
    Ok(target)
}

fn ease_out(target: f64, fraction: f64) -> f64 {
    target * (1.0 - (1.0 - fraction).powi(2))
}
