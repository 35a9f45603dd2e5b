//! Party Core - listen-together sync library
//!
//! Keeps every member of a party on one playback timeline: the server side
//! (lobby, authority, admission, broadcast) and the client side
//! (reconciliation engine and session runtime).

pub mod admission;
pub mod authority;
pub mod broadcast;
pub mod catalog;
pub mod client;
pub mod config;
pub mod lobby;
pub mod logging;
pub mod party_code;
pub mod reconcile;
pub mod sync;

// Re-exports for convenience
pub use catalog::{CatalogClient, CatalogError};
pub use client::{PartySession, PlaybackPrimitive, SessionCallback, SessionConfig, SessionError};
pub use config::{HostLeavePolicy, LobbyConfig, SyncConfig};
pub use lobby::{Lobby, Outcome};
pub use party_code::PartyCode;
pub use reconcile::{ClientSyncContext, Correction, PlayerState};
pub use sync::{ClientMessage, Party, ServerMessage, Snapshot};
