mod app;
mod client_info;
mod insight;
mod logging;
mod settings;
mod speedtest;
mod ui;

use anyhow::Result;
use app::{poll_event, App, AppAction, TestUpdate};
use clap::Parser;
use client_info::LookupEndpoints;
use crossterm::event::Event;
use logging::Logging;
use ratatui::DefaultTerminal;
use settings::{Cli, Settings};
use speedtest::{Engine, MetricsSnapshot, TestState};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use ui::draw_ui;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut logging = Logging::new();
    logging.init(cli.debug.as_deref())?;
    let settings = Settings::from(cli);
    info!(endpoints = ?settings.endpoints, "starting speedx");

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, settings).await;

    ratatui::restore();
    result
}

async fn run_app(terminal: &mut DefaultTerminal, settings: Settings) -> Result<()> {
    let mut app = App::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<TestUpdate>();

    let engine = {
        let tx = tx.clone();
        Engine::new(
            settings.clone(),
            move |state: TestState, metrics: MetricsSnapshot| {
                let _ = tx.send(TestUpdate::Snapshot { state, metrics });
            },
        )
    };

    if settings.client_info {
        let tx = tx.clone();
        tokio::spawn(async move {
            let info = client_info::lookup(&LookupEndpoints::default()).await;
            let _ = tx.send(TestUpdate::ClientInfo(info));
        });
    }

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        // Handle engine and lookup updates
        while let Ok(update) = rx.try_recv() {
            app.apply(update);
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.start().await });
                    }
                    AppAction::CancelTest => engine.stop(),
                    AppAction::RequestInsight => {
                        let tx = tx.clone();
                        let insight_settings = settings.insight.clone();
                        let (run, state, metrics) = (app.run, app.state, app.metrics);
                        tokio::spawn(async move {
                            if let Some(text) =
                                insight::generate(&insight_settings, state, &metrics).await
                            {
                                let _ = tx.send(TestUpdate::Insight { run, text });
                            }
                        });
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    engine.dispose();
    Ok(())
}
