use std::collections::VecDeque;
use std::time::Instant;

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Row, Table};
use ratatui::Frame;

use tandem::net::MAX_PLAYERS;
use tandem::server::{ServerEvent, SessionInfo};
use tandem::StatsSnapshot;

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

struct LogLine {
    at_secs: u64,
    level: Level,
    text: String,
}

/// Everything the dashboard shows that is not read fresh each frame.
pub struct TuiState {
    started: Instant,
    logs: VecDeque<LogLine>,
    scroll: usize,
}

/// Values sampled from the server right before drawing.
pub struct Dashboard {
    pub server_time: u32,
    pub players: Vec<SessionInfo>,
    pub reliable: StatsSnapshot,
    pub unreliable: StatsSnapshot,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            logs: VecDeque::with_capacity(MAX_LOG_LINES),
            scroll: 0,
        }
    }

    fn push(&mut self, level: Level, text: String) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogLine {
            at_secs: self.started.elapsed().as_secs(),
            level,
            text,
        });
    }

    pub fn log_info(&mut self, text: impl Into<String>) {
        self.push(Level::Info, text.into());
    }

    pub fn log_warn(&mut self, text: impl Into<String>) {
        self.push(Level::Warn, text.into());
    }

    pub fn log_error(&mut self, text: impl Into<String>) {
        self.push(Level::Error, text.into());
    }

    pub fn record(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ClientConnected { player_id, addr } => {
                self.log_info(format!("Player {} connected from {}", player_id, addr));
            }
            ServerEvent::PlayerJoined {
                player_id,
                udp_address,
            } => {
                self.log_info(format!("Player {} joined ({})", player_id, udp_address));
            }
            ServerEvent::ConnectionRejected { addr } => {
                self.log_warn(format!("Rejected {}: server full", addr));
            }
            ServerEvent::ClientDisconnected { player_id, reason } => {
                self.log_info(format!("Player {} {}", player_id, reason.as_str()));
            }
            ServerEvent::Chat { player_id, text } => {
                self.log_info(format!("<{}> {}", player_id, text));
            }
            ServerEvent::Ping { player_id } => {
                self.log_info(format!("Ping from player {}", player_id));
            }
            ServerEvent::Error { message } => self.log_error(message),
        }
    }

    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + 5).min(self.logs.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(5);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }

    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, view: &Dashboard) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length((MAX_PLAYERS + 3) as u16),
            Constraint::Length(5),
            Constraint::Min(4),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], state, view);
    render_capacity(frame, chunks[1], view);
    render_players(frame, chunks[2], view);
    render_network(frame, chunks[3], view);
    render_logs(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, state: &TuiState, view: &Dashboard) {
    let title = format!(" Tandem Server - Uptime: {} ", format_duration(state.uptime_secs()));
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Server time: {}ms  |  Players: {}",
        view.server_time,
        view.players.len()
    );
    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, view: &Dashboard) {
    let block = Block::default()
        .title(" Slots ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = view.players.len() as f64 / MAX_PLAYERS as f64;
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} players", view.players.len(), MAX_PLAYERS));
    frame.render_widget(gauge, area);
}

fn render_players(frame: &mut Frame, area: Rect, view: &Dashboard) {
    let header = Row::new(["Id", "UDP address", "Last input", "Queued"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = view.players.iter().map(|session| {
        Row::new([
            session.player_id.to_string(),
            session
                .udp_address
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "joining".into()),
            session
                .last_input_time
                .map(|t| format!("{}ms", t))
                .unwrap_or_else(|| "-".into()),
            session.queued_messages.to_string(),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Length(24),
            Constraint::Length(14),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .title(" Players ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta)),
    );
    frame.render_widget(table, area);
}

fn render_network(frame: &mut Frame, area: Rect, view: &Dashboard) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let lines = vec![
        stats_line("Reliable: ", &view.reliable),
        stats_line("Unreliable: ", &view.unreliable),
        Line::from(vec![
            Span::styled("Dropped: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} malformed / {} skipped / {} failed sends",
                    view.reliable.malformed + view.unreliable.malformed,
                    view.unreliable.skipped_sends,
                    view.unreliable.failed_sends
                ),
                Style::default().fg(Color::White),
            ),
        ]),
    ];
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn stats_line(label: &'static str, stats: &StatsSnapshot) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().fg(Color::Gray)),
        Span::styled(
            format!(
                "{} sent / {} recv ({} / {})",
                stats.messages_sent,
                stats.messages_received,
                format_bytes(stats.bytes_sent),
                format_bytes(stats.bytes_received)
            ),
            Style::default().fg(Color::White),
        ),
    ])
}

fn render_logs(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Log ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let end = state.logs.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);

    let lines: Vec<Line> = state
        .logs
        .range(start..end)
        .map(|line| {
            let color = match line.level {
                Level::Info => Color::White,
                Level::Warn => Color::Yellow,
                Level::Error => Color::Red,
            };
            Line::from(vec![
                Span::styled(
                    format!("[{}] ", format_duration(line.at_secs)),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(line.text.clone(), Style::default().fg(color)),
            ])
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("q/Esc quit  |  PgUp/PgDn scroll log  |  End follow log")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );
    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
