use crate::client_info::ClientInfo;
use crate::speedtest::{MetricsSnapshot, TestState};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::time::Duration;

/// Samples kept per chart.
const MAX_SAMPLES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Ping,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Ping,
            Panel::Ping => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Ping,
            Panel::Upload => Panel::Download,
            Panel::Ping => Panel::Upload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insight {
    None,
    Loading,
    Ready(String),
}

pub struct App {
    pub state: TestState,
    pub metrics: MetricsSnapshot,
    pub should_quit: bool,

    // UI state
    pub selected_panel: Panel,
    pub expanded: bool,

    // Speed samples for charts
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub ping_samples: Vec<f64>,

    pub client_info: Option<ClientInfo>,
    pub insight: Insight,
    /// Incremented whenever a new run begins.
    pub run: u64,
}

impl App {
    pub fn new() -> Self {
        Self {
            state: TestState::Idle,
            metrics: MetricsSnapshot::default(),
            should_quit: false,
            selected_panel: Panel::Download,
            expanded: false,
            download_samples: Vec::new(),
            upload_samples: Vec::new(),
            ping_samples: Vec::new(),
            client_info: None,
            insight: Insight::None,
            run: 0,
        }
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.state.accepts_start() {
                    Some(AppAction::StartTest)
                } else {
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.state.is_running() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Char('a') => {
                if self.state == TestState::Complete && self.insight != Insight::Loading {
                    self.insight = Insight::Loading;
                    Some(AppAction::RequestInsight)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    pub fn apply(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::Snapshot { state, metrics } => self.apply_snapshot(state, metrics),
            TestUpdate::ClientInfo(info) => self.client_info = Some(info),
            TestUpdate::Insight { run, text } => {
                // answers requested for an earlier run are dropped
                if run == self.run && self.insight == Insight::Loading {
                    self.insight = Insight::Ready(text);
                }
            }
        }
    }

    fn apply_snapshot(&mut self, state: TestState, metrics: MetricsSnapshot) {
        if state == TestState::Connecting && self.state != TestState::Connecting {
            self.reset_for_new_test();
        }

        match state {
            TestState::Download if metrics.download_speed_mbps != self.metrics.download_speed_mbps => {
                push_sample(&mut self.download_samples, metrics.download_speed_mbps);
            }
            TestState::Upload if metrics.upload_speed_mbps != self.metrics.upload_speed_mbps => {
                push_sample(&mut self.upload_samples, metrics.upload_speed_mbps);
            }
            _ => {}
        }
        if metrics.ping_ms > 0 && metrics.ping_ms != self.metrics.ping_ms {
            push_sample(&mut self.ping_samples, f64::from(metrics.ping_ms));
        }

        if state == TestState::Idle && self.state != TestState::Idle {
            self.reset_for_new_test();
        }
        self.state = state;
        self.metrics = metrics;
    }

    fn reset_for_new_test(&mut self) {
        self.run += 1;
        self.download_samples.clear();
        self.upload_samples.clear();
        self.ping_samples.clear();
        self.insight = Insight::None;
        self.expanded = false;
    }
}

fn push_sample(samples: &mut Vec<f64>, value: f64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
    RequestInsight,
}

/// Everything background tasks report back to the UI loop.
#[derive(Debug, Clone)]
pub enum TestUpdate {
    Snapshot {
        state: TestState,
        metrics: MetricsSnapshot,
    },
    ClientInfo(ClientInfo),
    Insight { run: u64, text: String },
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}
