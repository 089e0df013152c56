use crate::app::{App, Insight, Panel};
use crate::speedtest::TestState;
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph, Wrap},
    Frame,
};

const ACCENT: Color = Color::Rgb(100, 149, 237);
const SUCCESS: Color = Color::Rgb(134, 194, 156);
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220);
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130);
const WARN_DIM: Color = Color::Rgb(130, 110, 80);
const DANGER: Color = Color::Rgb(220, 120, 120);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

const EMPTY: &str = "-";

/// What one throughput or latency panel shows.
struct PanelView<'a> {
    title: &'static str,
    color: Color,
    dim_color: Color,
    headline: String,
    detail: Option<String>,
    /// Share of this panel's phase that is done, 0..=1.
    progress: Option<f64>,
    samples: &'a [f64],
    unit: &'static str,
}

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let insight_height = match app.insight {
        Insight::None => 0,
        _ => 5,
    };
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(1),
        Constraint::Min(8),
        Constraint::Length(insight_height),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .split(frame.area());

    draw_header(frame, chunks[0], app);
    draw_overall_progress(frame, chunks[1], app);

    if app.expanded {
        let view = panel_view(app, app.selected_panel);
        draw_expanded(frame, chunks[2], &view);
    } else {
        let panels = Layout::horizontal([
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
        ])
        .split(chunks[2]);
        for (area, panel) in panels.iter().zip([Panel::Download, Panel::Upload, Panel::Ping]) {
            let view = panel_view(app, panel);
            draw_panel(frame, *area, &view, app.selected_panel == panel);
        }
    }

    if insight_height > 0 {
        draw_insight(frame, chunks[3], &app.insight);
    }
    draw_client_info(frame, chunks[4], app);
    draw_help(frame, chunks[5], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(12),
        Constraint::Min(10),
        Constraint::Length(20),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new("speedx")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        chunks[0],
    );

    frame.render_widget(
        Paragraph::new(app.state.label())
            .style(Style::default().fg(state_color(app.state)))
            .alignment(Alignment::Center),
        chunks[1],
    );

    frame.render_widget(
        Paragraph::new(phase_line(app.state)).alignment(Alignment::Right),
        chunks[2],
    );
}

fn state_color(state: TestState) -> Color {
    match state {
        TestState::Idle => TEXT_MUTED,
        TestState::Connecting => WARN,
        TestState::Download => SUCCESS,
        TestState::Upload => INFO,
        TestState::Complete => ACCENT,
        TestState::Error => DANGER,
    }
}

fn phase_line(state: TestState) -> Line<'static> {
    let phases = [
        (TestState::Connecting, "ping"),
        (TestState::Download, "down"),
        (TestState::Upload, "up"),
    ];
    let position = |s: TestState| phases.iter().position(|(p, _)| *p == s);

    let mut spans = Vec::new();
    for (i, (phase, label)) in phases.iter().enumerate() {
        let done = state == TestState::Complete || position(state).is_some_and(|current| i < current);
        let style = if state == *phase {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if done {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };

        spans.push(Span::styled(*label, style));
        if i < phases.len() - 1 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
    }
    Line::from(spans)
}

fn draw_overall_progress(frame: &mut Frame, area: Rect, app: &App) {
    if app.state == TestState::Idle {
        return;
    }
    let ratio = app.metrics.progress_percent / 100.0;
    draw_progress_bar(frame, area, ratio, ACCENT, BORDER);
}

fn panel_view(app: &App, panel: Panel) -> PanelView<'_> {
    let metrics = &app.metrics;
    let progress = metrics.progress_percent;
    match panel {
        Panel::Download => PanelView {
            title: "Download",
            color: SUCCESS,
            dim_color: SUCCESS_DIM,
            headline: format_speed(metrics.download_speed_mbps),
            detail: None,
            progress: Some((progress / 50.0).clamp(0.0, 1.0)),
            samples: &app.download_samples,
            unit: "Mbps",
        },
        Panel::Upload => PanelView {
            title: "Upload",
            color: INFO,
            dim_color: INFO_DIM,
            headline: format_speed(metrics.upload_speed_mbps),
            detail: None,
            progress: Some(((progress - 50.0) / 50.0).clamp(0.0, 1.0)),
            samples: &app.upload_samples,
            unit: "Mbps",
        },
        Panel::Ping => PanelView {
            title: "Latency",
            color: WARN,
            dim_color: WARN_DIM,
            headline: format_ms(metrics.ping_ms),
            detail: Some(format!("jitter {}", format_ms(metrics.jitter_ms))),
            progress: None,
            samples: &app.ping_samples,
            unit: "ms",
        },
    }
}

fn draw_panel(frame: &mut Frame, area: Rect, view: &PanelView, selected: bool) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if selected { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            format!(" {} ", view.title),
            Style::default().fg(if selected { view.color } else { TEXT_SECONDARY }),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(view.headline.as_str())
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    match (&view.detail, view.progress) {
        (Some(detail), _) => frame.render_widget(
            Paragraph::new(detail.as_str())
                .style(Style::default().fg(TEXT_MUTED))
                .alignment(Alignment::Center),
            chunks[1],
        ),
        (None, Some(ratio)) => draw_progress_bar(frame, chunks[1], ratio, view.color, view.dim_color),
        (None, None) => {}
    }

    draw_sparkline(frame, chunks[2], view.samples, view.color);
}

fn draw_expanded(frame: &mut Frame, area: Rect, view: &PanelView) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_ACTIVE))
        .title(Span::styled(format!(" {} ", view.title), Style::default().fg(view.color)));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(4),
    ])
    .split(inner);

    let separator = || Span::styled("  ·  ", Style::default().fg(TEXT_MUTED));
    let mut spans = vec![Span::styled(
        view.headline.clone(),
        Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
    )];
    if let Some(detail) = &view.detail {
        spans.push(separator());
        spans.push(Span::styled(detail.clone(), Style::default().fg(TEXT_SECONDARY)));
    }
    if let Some(stats) = Stats::of(view.samples) {
        for (label, value) in [("avg", stats.avg), ("max", stats.max), ("min", stats.min)] {
            spans.push(separator());
            spans.push(Span::styled(
                format!("{label} {value:.1}"),
                Style::default().fg(TEXT_MUTED),
            ));
        }
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), chunks[0]);

    if let Some(ratio) = view.progress {
        draw_progress_bar(frame, chunks[1], ratio, view.color, view.dim_color);
    }

    draw_detailed_chart(frame, chunks[2], view.samples, view.color, view.unit);
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio.clamp(0.0, 1.0) * width as f64) as usize).min(width);
    let empty = width - filled;

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    let Some(stats) = Stats::of(data) else {
        return;
    };
    if area.width < 4 || area.height < 2 {
        return;
    }

    let range = (stats.max - stats.min).max(1.0);
    let points = indexed(data);
    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([stats.min - range * 0.1, stats.max + range * 0.1]));

    frame.render_widget(chart, area);
}

fn draw_detailed_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: &str) {
    let Some(stats) = Stats::of(data) else {
        return;
    };
    if area.width < 10 || area.height < 3 {
        return;
    }

    let range = (stats.max - stats.min).max(0.1);
    let y_min = (stats.min - range * 0.1).max(0.0);
    let y_max = stats.max + range * 0.1;

    let points = indexed(data);
    let avg_line = [(0.0, stats.avg), (data.len() as f64, stats.avg)];

    let datasets = vec![
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(color))
            .data(&points),
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(TEXT_MUTED))
            .data(&avg_line),
    ];

    let y_labels = vec![
        Span::styled(format!("{y_min:.0}"), Style::default().fg(TEXT_MUTED)),
        Span::styled(format!("{y_max:.0} {unit}"), Style::default().fg(TEXT_MUTED)),
    ];

    let chart = Chart::new(datasets)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([0.0, data.len() as f64]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([y_min, y_max])
                .labels(y_labels),
        );

    frame.render_widget(chart, area);
}

fn draw_insight(frame: &mut Frame, area: Rect, insight: &Insight) {
    let text = match insight {
        Insight::None => return,
        Insight::Loading => "Analyzing connection...",
        Insight::Ready(text) => text.as_str(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER))
        .title(Span::styled(" Insight ", Style::default().fg(ACCENT)));

    frame.render_widget(
        Paragraph::new(text)
            .style(Style::default().fg(TEXT_SECONDARY))
            .wrap(Wrap { trim: true })
            .block(block),
        area,
    );
}

fn draw_client_info(frame: &mut Frame, area: Rect, app: &App) {
    let Some(info) = &app.client_info else {
        return;
    };
    let line = Line::from(vec![
        Span::styled(info.ip.as_str(), Style::default().fg(TEXT_SECONDARY)),
        Span::styled("  ·  ", Style::default().fg(TEXT_MUTED)),
        Span::styled(info.isp.as_str(), Style::default().fg(TEXT_MUTED)),
        Span::styled("  ·  ", Style::default().fg(TEXT_MUTED)),
        Span::styled(info.location.as_str(), Style::default().fg(TEXT_MUTED)),
    ]);
    frame.render_widget(Paragraph::new(line).alignment(Alignment::Center), area);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    frame.render_widget(
        Paragraph::new(help_text(app))
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

fn help_text(app: &App) -> &'static str {
    if app.expanded {
        return "esc close · q quit";
    }
    match app.state {
        TestState::Complete => "enter restart · a analyze · tab select · space expand · q quit",
        TestState::Idle | TestState::Error => "enter start · tab select · space expand · q quit",
        _ => "tab select · space expand · esc cancel · q quit",
    }
}

fn indexed(data: &[f64]) -> Vec<(f64, f64)> {
    data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Stats {
    avg: f64,
    max: f64,
    min: f64,
}

impl Stats {
    fn of(data: &[f64]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        Some(Self {
            avg: data.iter().sum::<f64>() / data.len() as f64,
            max: data.iter().copied().fold(f64::MIN, f64::max),
            min: data.iter().copied().fold(f64::MAX, f64::min),
        })
    }
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        EMPTY.to_string()
    }
}

fn format_ms(ms: u32) -> String {
    if ms > 0 {
        format!("{ms} ms")
    } else {
        EMPTY.to_string()
    }
}
