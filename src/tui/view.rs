//! Dashboard rendering.
//!
//! ┌ gpuscope — LIVE 12:30:05 | autosave:true ──────────────┐
//! │ GPU 0 — NVIDIA A100          │ per-user memory          │
//! │ ████████████░░░░░░░░ 61%     │ alice      15872 MB      │
//! │ util 61% | mem 42% (...)     │ bob          512 MB      │
//! ├ processes ─────────────────────────────────────────────┤
//! │ GPU  PID     process            user        mem MB     │
//! ├────────────────────────────────────────────────────────┤
//! │ q quit · r refresh · s save · a autosave · h history…  │
//! └────────────────────────────────────────────────────────┘

use ratatui::{prelude::*, widgets::*};

use crate::export::{aggregate_by_user, threshold_alerts};
use crate::models::Snapshot;
use crate::session::{Mode, SessionState};

const HELP_LINE: &str =
    "q quit · r refresh · s save · a autosave · h history · t today · ←/→ snapshot · ↑/↓ day · f user · g gpu · m mem sort · c clear · ? help";

pub fn draw(f: &mut Frame, state: &SessionState, thresholds: (f64, f64)) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),  // title + filters
            Constraint::Min(8),     // devices | users
            Constraint::Length(10), // processes
            Constraint::Length(1),  // keys
        ])
        .split(f.area());

    draw_header(f, rows[0], state);

    if state.show_help {
        draw_help(f, rows[1]);
    } else {
        draw_main(f, rows[1], state, thresholds);
    }
    draw_processes(f, rows[2], state);

    let keys = Paragraph::new(HELP_LINE).style(Style::default().fg(Color::DarkGray));
    f.render_widget(keys, rows[3]);
}

fn draw_header(f: &mut Frame, area: Rect, state: &SessionState) {
    let mut title = vec![
        Span::styled("gpuscope", Style::default().bold().fg(Color::Cyan)),
        Span::raw("  "),
        Span::styled(state.status.as_str(), Style::default().fg(Color::Yellow)),
    ];
    if let Some(error) = &state.last_error {
        title.push(Span::raw("  "));
        title.push(Span::styled(
            error.as_str(),
            Style::default().fg(Color::Red),
        ));
    }

    let mut lines = vec![Line::from(title)];

    if state.filters.is_active() {
        let mut parts = Vec::new();
        if let Some(user) = &state.filters.user {
            parts.push(format!("user:{user}"));
        }
        if let Some(device) = state.filters.device {
            parts.push(format!("GPU:{device}"));
        }
        if state.filters.sort_by_mem {
            parts.push("sorted:mem".into());
        }
        lines.push(Line::from(Span::styled(
            format!("[filters: {}]", parts.join(", ")),
            Style::default().fg(Color::Magenta),
        )));
    } else if state.mode == Mode::History {
        lines.push(Line::from(Span::styled(
            format!("day {}  (↑/↓ to change)", state.selected_day),
            Style::default().fg(Color::DarkGray),
        )));
    }

    f.render_widget(Paragraph::new(lines), area);
}

fn draw_main(f: &mut Frame, area: Rect, state: &SessionState, thresholds: (f64, f64)) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(area);

    match state.visible_snapshot() {
        Some(snapshot) => {
            draw_devices(f, cols[0], &snapshot, thresholds);
            draw_users(f, cols[1], &snapshot);
        }
        None => {
            let placeholder = Paragraph::new("no snapshot loaded")
                .style(Style::default().fg(Color::DarkGray))
                .block(Block::default().borders(Borders::ALL).title(" devices "));
            f.render_widget(placeholder, cols[0]);
            let empty = Paragraph::new("")
                .block(Block::default().borders(Borders::ALL).title(" per-user memory "));
            f.render_widget(empty, cols[1]);
        }
    }
}

fn draw_devices(f: &mut Frame, area: Rect, snapshot: &Snapshot, thresholds: (f64, f64)) {
    let (max_temp, max_mem) = thresholds;
    let mut lines = Vec::new();

    for device in &snapshot.devices {
        lines.push(Line::from(Span::styled(
            format!("GPU {} — {}", device.index, device.name),
            Style::default().bold(),
        )));
        lines.push(Line::from(vec![
            Span::styled(bar(device.util_gpu, 24), util_style(device.util_gpu)),
            Span::raw(format!(" {:3.0}%", device.util_gpu)),
        ]));
        lines.push(Line::from(Span::styled(
            format!(
                "util {:3.0}% | mem {:3.0}% ({:.0}/{:.0} MB)",
                device.util_gpu, device.util_mem, device.mem_used_mb, device.mem_total_mb
            ),
            Style::default().fg(Color::DarkGray),
        )));
        lines.push(Line::from(Span::styled(
            format!(
                "temp {:3.0}°C | power {:.0}/{:.0} W",
                device.temp_c, device.power_w, device.power_limit_w
            ),
            Style::default().fg(Color::DarkGray),
        )));
        lines.push(Line::from(""));
    }

    for alert in threshold_alerts(snapshot, max_temp, max_mem) {
        lines.push(Line::from(Span::styled(
            format!("⚠ {alert}"),
            Style::default().fg(Color::Red).bold(),
        )));
    }

    if snapshot.devices.is_empty() {
        lines.push(Line::from(Span::styled(
            "no GPU data",
            Style::default().fg(Color::DarkGray),
        )));
    }

    let block = Block::default().borders(Borders::ALL).title(" devices ");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_users(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let usage = aggregate_by_user(snapshot);
    let rows: Vec<Row> = usage
        .iter()
        .map(|u| {
            Row::new(vec![
                u.owner.clone(),
                format!("{:>10.0} MB", u.mem_used_mb),
            ])
        })
        .collect();

    let table = Table::new(rows, [Constraint::Min(12), Constraint::Length(14)]).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" per-user memory "),
    );
    f.render_widget(table, area);
}

fn draw_processes(f: &mut Frame, area: Rect, state: &SessionState) {
    let rows: Vec<Row> = state
        .visible_snapshot()
        .map(|snapshot| {
            snapshot
                .processes
                .iter()
                .map(|p| {
                    Row::new(vec![
                        short_uuid(&p.gpu_uuid),
                        p.pid.to_string(),
                        p.process_name.clone(),
                        p.owner.clone(),
                        format!("{:.0}", p.used_mem_mb),
                    ])
                })
                .collect()
        })
        .unwrap_or_default();

    let table = Table::new(
        rows,
        [
            Constraint::Length(14),
            Constraint::Length(8),
            Constraint::Min(20),
            Constraint::Length(14),
            Constraint::Length(10),
        ],
    )
    .header(
        Row::new(vec!["GPU", "PID", "process", "user", "mem MB"])
            .style(Style::default().bold().fg(Color::Cyan)),
    )
    .block(Block::default().borders(Borders::ALL).title(" processes "));

    f.render_widget(table, area);
}

fn draw_help(f: &mut Frame, area: Rect) {
    let lines = vec![
        Line::from("q / Ctrl-C   quit"),
        Line::from("r            refresh once (live)"),
        Line::from("s            save current snapshot (live)"),
        Line::from("a            toggle auto-recording"),
        Line::from("h            toggle history mode"),
        Line::from("t            jump back to live view"),
        Line::from("← / →        previous / next snapshot (history)"),
        Line::from("↑ / ↓        previous / next day (history)"),
        Line::from("f            cycle user filter"),
        Line::from("g            cycle GPU filter"),
        Line::from("m            sort processes by memory"),
        Line::from("c            clear filters"),
    ];
    let block = Block::default().borders(Borders::ALL).title(" keys ");
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn bar(value: f64, width: usize) -> String {
    let clamped = value.clamp(0.0, 100.0);
    let filled = ((clamped / 100.0) * width as f64).round() as usize;
    let mut s = String::with_capacity(width);
    for i in 0..width {
        s.push(if i < filled { '█' } else { '░' });
    }
    s
}

fn util_style(value: f64) -> Style {
    if value >= 90.0 {
        Style::default().fg(Color::Red)
    } else if value >= 60.0 {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::Green)
    }
}

fn short_uuid(uuid: &str) -> String {
    if uuid.len() > 12 {
        format!("{}…", &uuid[..12])
    } else {
        uuid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_is_empty_at_zero_and_full_at_hundred() {
        assert_eq!(bar(0.0, 10), "░░░░░░░░░░");
        assert_eq!(bar(100.0, 10), "██████████");
    }

    #[test]
    fn bar_clamps_out_of_range_values() {
        assert_eq!(bar(-5.0, 4), "░░░░");
        assert_eq!(bar(250.0, 4), "████");
    }

    #[test]
    fn short_uuid_truncates_long_identifiers() {
        assert_eq!(short_uuid("GPU-aaaa"), "GPU-aaaa");
        assert_eq!(
            short_uuid("GPU-8f4c3a1e-0001-0002-0003-abcdefabcdef"),
            "GPU-8f4c3a1e…"
        );
    }
}
