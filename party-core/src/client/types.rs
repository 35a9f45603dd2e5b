//! Types for the client session: callbacks, playback seam, errors

use std::time::Duration;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::reconcile::PlayerState;
use crate::sync::{ErrorCode, Member, PartySummary, RejectReason, Snapshot};

/// Fixed delay between reconnection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How often the host in host mode reports its position
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Errors returned by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not connected to the party server")]
    NotConnected,

    #[error("Not in a party")]
    NotInParty,

    #[error("Already in a party")]
    AlreadyInParty,

    #[error("Invalid party code: {0}")]
    InvalidPartyCode(String),

    #[error("No catalog configured")]
    NoCatalog,

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Failures reported by the local audio player
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    /// The platform refused to start audio without a user gesture
    #[error("Playback blocked until user interaction")]
    Blocked,

    #[error("Failed to load track {0}")]
    LoadFailed(String),

    #[error("Playback failed: {0}")]
    Failed(String),
}

/// The local audio player the session drives.
///
/// Calls are synchronous and must not block for long; the session invokes
/// them from its socket task.
pub trait PlaybackPrimitive: Send + Sync {
    fn load_track(&self, track_id: &str) -> Result<(), PlaybackError>;
    fn unload(&self);
    fn play(&self) -> Result<(), PlaybackError>;
    fn pause(&self);
    fn seek_to(&self, seconds: f64);
    fn set_volume(&self, volume: f32);
    /// Current track, position, play state and volume
    fn state(&self) -> PlayerState;
}

/// Callback interface for session events
pub trait SessionCallback: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self);
    /// A reconnection attempt is scheduled
    fn on_reconnecting(&self, attempt: u32);
    /// All reconnection attempts failed
    fn on_connection_lost(&self);
    fn on_lobby_changed(&self, users: Vec<Member>, parties: Vec<PartySummary>);
    fn on_party_synced(&self, snapshot: Snapshot);
    fn on_action_rejected(&self, reason: RejectReason);
    fn on_error(&self, code: ErrorCode, message: String);
    /// Local membership ended: left, dissolved or the party vanished
    fn on_party_left(&self, reason: String);
    fn on_playback_error(&self, error: PlaybackError);
}

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket base, e.g. `ws://host:8000`
    pub server_url: String,
    pub user_id: String,
    pub display_name: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub catalog_url: Option<String>,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            catalog_url: None,
        }
    }

    pub fn with_catalog(mut self, catalog_url: impl Into<String>) -> Self {
        self.catalog_url = Some(catalog_url.into());
        self
    }

    /// Endpoint for this user's party channel
    pub fn socket_url(&self) -> String {
        format!("{}/ws/{}", self.server_url.trim_end_matches('/'), self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("ws://localhost:8000/", "u1", "Alice").with_catalog("http://localhost:8000");
        assert_eq!(config.socket_url(), "ws://localhost:8000/ws/u1");
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.catalog_url.as_deref(), Some("http://localhost:8000"));
    }
}
