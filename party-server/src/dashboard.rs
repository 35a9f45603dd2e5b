//! Terminal dashboard for the party server

use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use party_core::logging::{self, DEFAULT_DIRECTIVES};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use tracing_subscriber::prelude::*;

use crate::config::ServerConfig;
use crate::metrics::{DashboardLayer, LogLevel, Metrics, ServerStatus};
use crate::network;

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
}

impl DashboardState {
    fn scroll_up(&mut self, lines: usize, log_count: usize) {
        if log_count > 0 {
            self.log_scroll = (self.log_scroll + lines).min(log_count.saturating_sub(1));
            self.auto_scroll = false;
        }
    }

    fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
        if self.log_scroll == 0 {
            self.auto_scroll = true;
        }
    }
}

/// Run the dashboard
pub async fn run(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    // Log lines go to the activity panel instead of the terminal
    let (layer, mut log_rx) = DashboardLayer::new();
    tracing_subscriber::registry()
        .with(logging::env_filter(DEFAULT_DIRECTIVES)?)
        .with(layer)
        .try_init()?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Start the server in background
    let metrics_for_network = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = network::run_with_dashboard(config, Arc::clone(&metrics_for_network)).await {
            let mut m = metrics_for_network.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Server error: {}", e));
        }
    });

    let mut state = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
    };

    let tick_rate = Duration::from_millis(100);
    let mut should_quit = false;

    while !should_quit {
        // Drain mirrored log lines
        let mut new_lines = false;
        while let Ok(entry) = log_rx.try_recv() {
            metrics.write().push_entry(entry);
            new_lines = true;
        }
        if new_lines && state.auto_scroll {
            state.log_scroll = 0;
        }

        terminal.draw(|f| draw(f, &metrics, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = metrics.read().logs.len();

                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => should_quit = true,
                        KeyCode::Char('c') if key.modifiers.contains(event::KeyModifiers::CONTROL) => {
                            should_quit = true
                        }
                        KeyCode::Up | KeyCode::Char('k') => state.scroll_up(1, log_count),
                        KeyCode::Down | KeyCode::Char('j') => state.scroll_down(1),
                        KeyCode::PageUp => state.scroll_up(10, log_count),
                        KeyCode::PageDown => state.scroll_down(10),
                        // Home - oldest logs
                        KeyCode::Home => state.scroll_up(log_count, log_count),
                        // End - newest logs (enable auto-scroll)
                        KeyCode::End => state.scroll_down(log_count),
                        KeyCode::Char('a') => {
                            state.auto_scroll = !state.auto_scroll;
                            if state.auto_scroll {
                                state.log_scroll = 0;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(6), // Stats
            Constraint::Min(10),   // Logs
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);
    draw_logs(f, chunks[2], &m, state);
    draw_footer(f, chunks[3], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_style) = match m.status {
        ServerStatus::Starting => ("STARTING", Style::default().fg(Color::Yellow)),
        ServerStatus::Running => ("RUNNING", Style::default().fg(Color::Green)),
        ServerStatus::Error => ("ERROR", Style::default().fg(Color::Red)),
    };

    let title = Line::from(vec![
        Span::styled("Party Server", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  Status: "),
        Span::styled(status_text, status_style),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ]);

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));
    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let server_info = vec![
        Line::from(vec![
            Span::raw("Listen: "),
            Span::styled(
                m.listen_addr.clone().unwrap_or_else(|| "...".to_string()),
                Style::default().fg(Color::Yellow),
            ),
        ]),
        Line::from(vec![
            Span::raw("Catalog: "),
            Span::styled(
                m.catalog_url.clone().unwrap_or_else(|| "none".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Users: "),
            Span::styled(m.lobby.users.to_string(), Style::default().fg(Color::White)),
        ]),
    ];
    let server_block = Paragraph::new(server_info).block(Block::default().borders(Borders::ALL).title(" Server "));
    f.render_widget(server_block, chunks[0]);

    let conn_info = vec![
        Line::from(vec![
            Span::raw("Active: "),
            Span::styled(
                m.active_connections.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Total: "),
            Span::styled(m.total_connections.to_string(), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::raw("Peak: "),
            Span::styled(m.peak_connections.to_string(), Style::default().fg(Color::Magenta)),
        ]),
    ];
    let conn_block = Paragraph::new(conn_info).block(Block::default().borders(Borders::ALL).title(" Connections "));
    f.render_widget(conn_block, chunks[1]);

    let party_info = vec![
        Line::from(vec![
            Span::raw("Parties: "),
            Span::styled(
                m.lobby.parties.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Accepted: "),
            Span::styled(m.lobby.accepted.to_string(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Rejected: "),
            Span::styled(
                format!(
                    "{}/{}/{} ({:.1}%)",
                    m.lobby.denied,
                    m.lobby.rate_limited,
                    m.lobby.failed,
                    m.rejection_rate()
                ),
                Style::default().fg(Color::Yellow),
            ),
        ]),
    ];
    let party_block = Paragraph::new(party_info)
        .block(Block::default().borders(Borders::ALL).title(" Parties (denied/limited/failed) "));
    f.render_widget(party_block, chunks[2]);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Connection => Style::default().fg(Color::Green),
                LogLevel::Party => Style::default().fg(Color::Magenta),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin { vertical: 1, horizontal: 0 }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", Style::default().fg(Color::Black).bg(Color::White)),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ ", Style::default().fg(Color::Black).bg(Color::White)),
        Span::raw(" Scroll  "),
        Span::styled(" PgUp/Dn ", Style::default().fg(Color::Black).bg(Color::White)),
        Span::raw(" Page  "),
        Span::styled(" A ", Style::default().fg(Color::Black).bg(Color::White)),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrolling() {
        let mut state = DashboardState {
            log_scroll: 0,
            auto_scroll: true,
        };

        state.scroll_up(10, 5);
        assert_eq!(state.log_scroll, 4);
        assert!(!state.auto_scroll);

        state.scroll_down(1);
        assert_eq!(state.log_scroll, 3);
        assert!(!state.auto_scroll);

        state.scroll_down(10);
        assert_eq!(state.log_scroll, 0);
        assert!(state.auto_scroll);

        state.scroll_up(1, 0);
        assert!(state.auto_scroll);
    }
}
