use anyhow::{anyhow, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Holds the log writer alive for the lifetime of the program.
///
/// The terminal belongs to the TUI, so logs only go to a file and only when
/// one is requested.
pub(crate) struct Logging {
    file_guard: Option<WorkerGuard>,
}

impl Logging {
    pub(crate) fn new() -> Self {
        Logging { file_guard: None }
    }

    pub(crate) fn init(&mut self, debug: Option<&Path>) -> Result<&mut Self> {
        let Some(file_path) = debug else {
            return Ok(self);
        };

        let _ = std::fs::remove_file(file_path);
        let file_appender = tracing_appender::rolling::never("", file_path);
        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking_file)
            .with_filter(filter);
        self.file_guard = Some(file_guard);

        let subscriber = tracing_subscriber::registry().with(file_layer);
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow!("setting default subscriber failed: {e}"))?;

        Ok(self)
    }
}
