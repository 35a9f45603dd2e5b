//! Party State
//!
//! Wire messages, the canonical party record and its queue manager.

mod protocol;
mod queue;
mod state;

pub use protocol::*;
pub use queue::Selection;
pub use state::*;
