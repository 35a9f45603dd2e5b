//! Metrics tracking for the party server

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use party_core::lobby::LobbyStats;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Party,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Party => "PARTY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub connected_at: DateTime<Local>,
}

/// Server metrics
pub struct Metrics {
    pub start_time: DateTime<Local>,

    /// Address the WebSocket listener is bound to
    pub listen_addr: Option<String>,

    pub catalog_url: Option<String>,

    /// Open WebSocket connections
    pub active_connections: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    pub connection_list: Vec<ConnectionInfo>,

    /// Latest lobby counters (parties, users, action outcomes)
    pub lobby: LobbyStats,

    pub logs: VecDeque<LogEntry>,

    pub status: ServerStatus,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            listen_addr: None,
            catalog_url: None,
            active_connections: 0,
            total_connections: 0,
            peak_connections: 0,
            connection_list: Vec::new(),
            lobby: LobbyStats::default(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.push_entry(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    pub fn push_entry(&mut self, entry: LogEntry) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }

    pub fn connection_opened(&mut self, user_id: &str) {
        self.active_connections += 1;
        self.total_connections += 1;
        if self.active_connections > self.peak_connections {
            self.peak_connections = self.active_connections;
        }

        self.connection_list.push(ConnectionInfo {
            user_id: user_id.to_string(),
            connected_at: Local::now(),
        });
        self.log(LogLevel::Connection, format!("Connected: {}", truncate_id(user_id)));
    }

    /// Record a closed connection (only if it was tracked)
    pub fn connection_closed(&mut self, user_id: &str) {
        let Some(index) = self.connection_list.iter().position(|c| c.user_id == user_id) else {
            return;
        };

        self.connection_list.remove(index);
        self.active_connections = self.active_connections.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: {}", truncate_id(user_id)));
    }

    /// Share of party actions that were not accepted, in percent
    pub fn rejection_rate(&self) -> f64 {
        let s = &self.lobby;
        let total = s.accepted + s.denied + s.rate_limited + s.failed;
        if total == 0 {
            0.0
        } else {
            (s.denied + s.rate_limited + s.failed) as f64 * 100.0 / total as f64
        }
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate an id for display (show first and last few chars)
pub fn truncate_id(id: &str) -> String {
    if id.chars().count() > 16 {
        let head: String = id.chars().take(8).collect();
        let tail: String = id.chars().skip(id.chars().count() - 4).collect();
        format!("{}...{}", head, tail)
    } else {
        id.to_string()
    }
}

/// Tracing layer that forwards events to the dashboard's activity log.
///
/// Entries go through a channel: the layer may fire while the metrics lock
/// is held, so it never touches the lock itself.
pub struct DashboardLayer {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl DashboardLayer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<S: Subscriber> Layer<S> for DashboardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warning,
            _ if metadata.target().starts_with("party_core::lobby") => LogLevel::Party,
            _ => LogLevel::Info,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(LogEntry {
            timestamp: Local::now(),
            level,
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_log_is_bounded() {
        let mut metrics = Metrics::new();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            metrics.log(LogLevel::Info, format!("line {}", i));
        }
        assert_eq!(metrics.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(metrics.logs.front().map(|e| e.message.as_str()), Some("line 5"));
    }

    #[test]
    fn test_connection_counts() {
        let mut metrics = Metrics::new();
        metrics.connection_opened("alice");
        metrics.connection_opened("bob");
        metrics.connection_closed("alice");
        metrics.connection_closed("ghost");

        assert_eq!(metrics.active_connections, 1);
        assert_eq!(metrics.total_connections, 2);
        assert_eq!(metrics.peak_connections, 2);
        assert_eq!(metrics.connection_list[0].user_id, "bob");
    }

    #[test]
    fn test_rejection_rate() {
        let mut metrics = Metrics::new();
        assert_eq!(metrics.rejection_rate(), 0.0);
        metrics.lobby = LobbyStats {
            accepted: 6,
            denied: 1,
            rate_limited: 2,
            failed: 1,
            ..LobbyStats::default()
        };
        assert!((metrics.rejection_rate() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("short"), "short");
        assert_eq!(truncate_id("0123456789abcdefXYZ"), "01234567...fXYZ");
    }

    #[test]
    fn test_dashboard_layer_forwards_events() {
        let (layer, mut rx) = DashboardLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("Party {} dissolved", "ABCD");
        });

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.message, "Party ABCD dissolved");
    }
}
