use super::{
    download::DownloadProbe, http_client, ping::LatencyProbe, simulation, upload::UploadProbe,
    CancellationToken, MetricsSnapshot, ProbeError, TestState,
};
use crate::settings::Settings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Receives a copy of the engine state after every state or metric change.
///
/// Called with the engine lock held, so implementations must return quickly
/// and must not call back into the [`Engine`].
pub trait Observer: Send + Sync {
    fn notify(&self, state: TestState, metrics: MetricsSnapshot);
}

impl<F> Observer for F
where
    F: Fn(TestState, MetricsSnapshot) + Send + Sync,
{
    fn notify(&self, state: TestState, metrics: MetricsSnapshot) {
        self(state, metrics)
    }
}

/// Sequences latency, download and upload phases and substitutes a
/// simulation for any phase whose live probe fails.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    observer: Box<dyn Observer>,
    settings: Settings,
    rng: Mutex<StdRng>,
}

#[derive(Default)]
struct Inner {
    state: TestState,
    metrics: MetricsSnapshot,
    token: Option<CancellationToken>,
    disposed: bool,
}

impl Engine {
    pub fn new(settings: Settings, observer: impl Observer + 'static) -> Self {
        Self::with_rng(settings, observer, StdRng::from_entropy())
    }

    /// Like [`Engine::new`] with a caller supplied random source, used for
    /// upload payloads and simulated values.
    pub fn with_rng(settings: Settings, observer: impl Observer + 'static, rng: StdRng) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                observer: Box::new(observer),
                settings,
                rng: Mutex::new(rng),
            }),
        }
    }

    pub fn state(&self) -> TestState {
        self.lock().state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.lock().metrics
    }

    /// Runs one full test. Returns immediately without side effects when a
    /// run is already in progress or the engine has been disposed.
    pub async fn start(&self) {
        let Some(token) = self.begin() else {
            return;
        };
        let phase = PhaseHandle {
            engine: self.clone(),
            token,
        };
        let outcome = self.run(&phase).await;
        self.finish(&phase.token, outcome);
    }

    /// Cancels the current run, if any, and returns to `Idle` with zeroed
    /// metrics. Safe to call repeatedly and from any state.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let Some(token) = &inner.token {
            if token.cancel() {
                info!("cancelling speed test");
            }
        }
        inner.state = TestState::Idle;
        inner.metrics.reset();
        self.notify(&inner);
    }

    /// Zeroes the metrics without touching the state.
    pub fn reset(&self) {
        self.lock().metrics.reset();
    }

    /// Stops the engine for good; later calls to [`Engine::start`] are no-ops.
    pub fn dispose(&self) {
        self.lock().disposed = true;
        self.stop();
    }

    fn begin(&self) -> Option<CancellationToken> {
        let mut inner = self.lock();
        if inner.disposed {
            debug!("start ignored, engine disposed");
            return None;
        }
        if !inner.state.accepts_start() {
            debug!(state = ?inner.state, "start ignored, test already running");
            return None;
        }

        let token = CancellationToken::new();
        inner.metrics.reset();
        inner.token = Some(token.clone());
        inner.state = TestState::Connecting;
        self.notify(&inner);
        info!("speed test started");
        Some(token)
    }

    async fn run(&self, phase: &PhaseHandle) -> Result<(), ProbeError> {
        let endpoints = self.shared.settings.endpoints.resolve()?;
        let client = http_client()?;
        let mut rng = StdRng::seed_from_u64(self.rng().gen());
        let mut fallback = false;

        // Latency
        let mut latency = LatencyProbe::new();
        let measured = latency
            .run(&client, &endpoints.ping, phase)
            .await
            .map(|r| debug!(ping_ms = r.ping_ms, jitter_ms = r.jitter_ms, "latency measured"));
        if recoverable("latency", measured)? {
            fallback = true;
            simulation::latency(phase, &mut rng).await?;
        }

        // Download
        phase.transition(TestState::Download)?;
        if fallback {
            simulation::ramp(phase, &simulation::DOWNLOAD_RAMP, &mut rng).await?;
        } else {
            let mut download = DownloadProbe::new();
            let measured = download
                .run(&client, &endpoints.download, phase)
                .await
                .map(|r| debug!(mbps = r.avg_speed_mbps, "download measured"));
            if recoverable("download", measured)? {
                fallback = true;
                simulation::ramp(phase, &simulation::DOWNLOAD_RAMP, &mut rng).await?;
            }
        }

        // Upload
        phase.transition(TestState::Upload)?;
        if fallback {
            simulation::ramp(phase, &simulation::UPLOAD_RAMP, &mut rng).await?;
        } else {
            let mut upload = UploadProbe::new(&mut rng);
            let measured = upload
                .run(&client, &endpoints.upload, phase)
                .await
                .map(|r| debug!(mbps = r.avg_speed_mbps, "upload measured"));
            if recoverable("upload", measured)? {
                simulation::ramp(phase, &simulation::UPLOAD_RAMP, &mut rng).await?;
            }
        }

        phase.complete()
    }

    fn finish(&self, token: &CancellationToken, outcome: Result<(), ProbeError>) {
        let err = match outcome {
            Ok(()) => {
                let metrics = self.metrics();
                info!(
                    download_mbps = metrics.download_speed_mbps,
                    upload_mbps = metrics.upload_speed_mbps,
                    ping_ms = metrics.ping_ms,
                    jitter_ms = metrics.jitter_ms,
                    "speed test complete"
                );
                return;
            }
            Err(err) => err,
        };

        let mut inner = self.lock();
        let current = inner.token.as_ref().is_some_and(|t| t.same_as(token));
        if !current {
            return;
        }
        if err.is_cancelled() || token.is_cancelled() {
            info!("speed test aborted");
            if inner.state != TestState::Idle {
                inner.state = TestState::Idle;
                inner.metrics.reset();
                self.notify(&inner);
            }
        } else {
            error!(error = %err, "speed test failed");
            inner.state = TestState::Error;
            self.notify(&inner);
        }
    }

    fn notify(&self, inner: &Inner) {
        self.shared.observer.notify(inner.state, inner.metrics);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.shared.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Splits a phase outcome into "continue live", "switch to simulation" and
/// "abort the run".
fn recoverable(phase: &str, result: Result<(), ProbeError>) -> Result<bool, ProbeError> {
    match result {
        Ok(()) => Ok(false),
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            warn!(phase, error = %err, "live measurement failed, switching to simulation");
            Ok(true)
        }
    }
}

/// A probe's access to the engine for the duration of one phase.
///
/// Every mutation goes through [`PhaseHandle::publish`], which refuses to
/// touch the engine once the run's token has been signalled.
pub struct PhaseHandle {
    engine: Engine,
    token: CancellationToken,
}

impl PhaseHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails with [`ProbeError::Cancelled`] once the run has been stopped.
    pub fn check(&self) -> Result<(), ProbeError> {
        if self.token.is_cancelled() {
            Err(ProbeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Applies `update` to the live metrics and notifies the observer.
    /// Progress never moves backwards within a run.
    pub fn publish(&self, update: impl FnOnce(&mut MetricsSnapshot)) -> Result<(), ProbeError> {
        let mut inner = self.engine.lock();
        self.check()?;
        let floor = inner.metrics.progress_percent;
        update(&mut inner.metrics);
        inner.metrics.progress_percent = inner.metrics.progress_percent.clamp(floor, 100.0);
        self.engine.notify(&inner);
        Ok(())
    }

    fn transition(&self, state: TestState) -> Result<(), ProbeError> {
        let mut inner = self.engine.lock();
        self.check()?;
        debug!(from = ?inner.state, to = ?state, "phase transition");
        inner.state = state;
        if state == TestState::Upload {
            // upload owns the second half of progress even if download ended early
            inner.metrics.progress_percent = inner.metrics.progress_percent.max(50.0);
        }
        self.engine.notify(&inner);
        Ok(())
    }

    fn complete(&self) -> Result<(), ProbeError> {
        let mut inner = self.engine.lock();
        self.check()?;
        inner.state = TestState::Complete;
        inner.metrics.progress_percent = 100.0;
        self.engine.notify(&inner);
        Ok(())
    }
}

#[cfg(test)]
impl Engine {
    /// Opens a phase outside of a full run so probes can be driven directly.
    pub(crate) fn attach(&self) -> PhaseHandle {
        let token = CancellationToken::new();
        self.lock().token = Some(token.clone());
        PhaseHandle {
            engine: self.clone(),
            token,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{recording_engine, Recorded};
    use super::*;
    use crate::settings::Endpoints;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Nothing listens on port 1; every request is refused.
    fn unreachable_settings() -> Settings {
        Settings {
            endpoints: Endpoints::with_base("http://127.0.0.1:1"),
            ..Settings::default()
        }
    }

    fn snapshots(recorded: &Recorded) -> Vec<(TestState, MetricsSnapshot)> {
        recorded.lock().unwrap().clone()
    }

    async fn wait_for_state(engine: &Engine, state: TestState) {
        for _ in 0..10_000 {
            if engine.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine never reached {state:?}");
    }

    #[test]
    fn stop_from_idle_is_harmless_and_repeatable() {
        let (engine, recorded) = recording_engine(Settings::default(), 1);
        engine.stop();
        engine.stop();
        let seen = snapshots(&recorded);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[0].0, TestState::Idle);
        assert!(seen[0].1.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_network_falls_back_and_completes() {
        let (engine, recorded) = recording_engine(unreachable_settings(), 7);
        engine.start().await;

        assert_eq!(engine.state(), TestState::Complete);
        let metrics = engine.metrics();
        // every latency attempt failed without raising
        assert_eq!((metrics.ping_ms, metrics.jitter_ms), (50, 10));
        assert_eq!(metrics.progress_percent, 100.0);
        assert!((60.0..100.0).contains(&metrics.download_speed_mbps));
        assert_eq!(metrics.download_speed_mbps.fract(), 0.0);
        assert!((20.0..40.0).contains(&metrics.upload_speed_mbps));
        assert_eq!(metrics.upload_speed_mbps.fract(), 0.0);

        let seen = snapshots(&recorded);
        assert_eq!(seen.first().map(|s| s.0), Some(TestState::Connecting));
        assert!(seen.first().unwrap().1.is_zero());
        let mut last = 0.0;
        for (state, metrics) in &seen {
            assert!(metrics.progress_percent >= last, "progress went backwards");
            last = metrics.progress_percent;
            match state {
                TestState::Download => assert!(metrics.progress_percent <= 50.0),
                TestState::Upload => assert!(metrics.progress_percent >= 50.0),
                _ => {}
            }
            assert!(metrics.download_speed_mbps <= 1000.0);
            assert!(metrics.upload_speed_mbps <= 1000.0);
        }
        assert_eq!(seen.last().map(|s| s.0), Some(TestState::Complete));
    }

    #[tokio::test]
    async fn invalid_endpoint_ends_in_error_state() {
        let settings = Settings {
            endpoints: Endpoints {
                ping_url: "::not-a-url::".into(),
                ..Endpoints::default()
            },
            ..Settings::default()
        };
        let (engine, recorded) = recording_engine(settings, 3);
        engine.start().await;

        assert_eq!(engine.state(), TestState::Error);
        let states: Vec<_> = snapshots(&recorded).into_iter().map(|s| s.0).collect();
        assert_eq!(states, vec![TestState::Connecting, TestState::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_accepts_a_new_start() {
        let (engine, _) = recording_engine(unreachable_settings(), 4);
        engine.lock().state = TestState::Error;
        engine.start().await;
        assert_eq!(engine.state(), TestState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_running_is_a_no_op() {
        let (engine, recorded) = recording_engine(unreachable_settings(), 11);
        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        wait_for_state(&engine, TestState::Download).await;

        let before_metrics = engine.metrics();
        let before_token = engine.lock().token.clone().unwrap();
        let before_count = recorded.lock().unwrap().len();

        engine.start().await;

        assert_eq!(engine.state(), TestState::Download);
        assert_eq!(engine.metrics(), before_metrics);
        assert!(engine.lock().token.as_ref().unwrap().same_as(&before_token));
        assert_eq!(recorded.lock().unwrap().len(), before_count);

        run.await.unwrap();
        assert_eq!(engine.state(), TestState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_simulation_resets_and_ends_run() {
        let (engine, recorded) = recording_engine(unreachable_settings(), 5);
        let run = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        wait_for_state(&engine, TestState::Download).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(engine.metrics().download_speed_mbps > 0.0);

        engine.stop();
        assert_eq!(engine.state(), TestState::Idle);
        assert!(engine.metrics().is_zero());
        let first = *recorded.lock().unwrap().last().unwrap();

        engine.stop();
        let second = *recorded.lock().unwrap().last().unwrap();
        assert_eq!(first, second);

        run.await.unwrap();
        assert_eq!(engine.state(), TestState::Idle);
        assert!(engine.metrics().is_zero());
        let last = *recorded.lock().unwrap().last().unwrap();
        assert_eq!(last, (TestState::Idle, MetricsSnapshot::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_run_does_not_disturb_the_next_one() {
        let (engine, _) = recording_engine(unreachable_settings(), 9);
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        wait_for_state(&engine, TestState::Download).await;
        engine.stop();

        engine.start().await;
        first.await.unwrap();
        assert_eq!(engine.state(), TestState::Complete);
        assert_eq!(engine.metrics().progress_percent, 100.0);
    }

    #[tokio::test]
    async fn disposed_engine_ignores_start() {
        let (engine, recorded) = recording_engine(unreachable_settings(), 2);
        engine.dispose();
        engine.start().await;
        assert_eq!(engine.state(), TestState::Idle);
        assert_eq!(recorded.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_keeps_state() {
        let (engine, _) = recording_engine(Settings::default(), 6);
        {
            let mut inner = engine.lock();
            inner.state = TestState::Complete;
            inner.metrics.ping_ms = 12;
        }
        engine.reset();
        assert_eq!(engine.state(), TestState::Complete);
        assert!(engine.metrics().is_zero());
    }

    #[tokio::test]
    async fn live_run_against_local_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn-cgi/trace"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ip=127.0.0.1\n"))
            .expect(5)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/__down"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2_000_000]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/__up"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let settings = Settings {
            endpoints: Endpoints::with_base(&server.uri()),
            ..Settings::default()
        };
        let (engine, _) = recording_engine(settings, 8);
        engine.start().await;

        assert_eq!(engine.state(), TestState::Complete);
        let metrics = engine.metrics();
        assert_eq!(metrics.progress_percent, 100.0);
        assert!(metrics.download_speed_mbps > 0.0 && metrics.download_speed_mbps <= 1000.0);
        assert!(metrics.upload_speed_mbps > 0.0 && metrics.upload_speed_mbps <= 1000.0);
        assert!(metrics.ping_ms < 50);
    }

    #[tokio::test]
    async fn failed_upload_alone_is_simulated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn-cgi/trace"))
            .respond_with(ResponseTemplate::new(200).set_body_string("h=local\n"))
            .expect(5)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/__down"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1_000_000]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/__up"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let settings = Settings {
            endpoints: Endpoints::with_base(&server.uri()),
            ..Settings::default()
        };
        let (engine, recorded) = recording_engine(settings, 12);
        engine.start().await;

        assert_eq!(engine.state(), TestState::Complete);
        let metrics = engine.metrics();
        assert_eq!(metrics.progress_percent, 100.0);
        assert!(metrics.ping_ms < 50);
        assert!(metrics.download_speed_mbps > 0.0 && metrics.download_speed_mbps <= 1000.0);
        assert!((20.0..40.0).contains(&metrics.upload_speed_mbps));
        assert_eq!(metrics.upload_speed_mbps.fract(), 0.0);

        // the download figure survives the upload ramp untouched
        let at_upload = snapshots(&recorded)
            .into_iter()
            .find(|(state, _)| *state == TestState::Upload)
            .map(|(_, m)| m.download_speed_mbps);
        assert_eq!(at_upload, Some(metrics.download_speed_mbps));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_switches_remaining_phases_to_simulation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn-cgi/trace"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/__down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/__up"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let settings = Settings {
            endpoints: Endpoints::with_base(&server.uri()),
            ..Settings::default()
        };
        let (engine, _) = recording_engine(settings, 10);
        engine.start().await;

        assert_eq!(engine.state(), TestState::Complete);
        let metrics = engine.metrics();
        assert!((20.0..40.0).contains(&metrics.upload_speed_mbps));
        assert_eq!(metrics.upload_speed_mbps.fract(), 0.0);
    }
}
