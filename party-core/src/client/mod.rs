//! Client Session Runtime
//!
//! Connects to the party server, feeds snapshots through the reconciliation
//! engine into a [`PlaybackPrimitive`], and turns user actions into party
//! messages.

mod handlers;
mod session;
mod types;

pub use session::PartySession;
pub use types::*;
