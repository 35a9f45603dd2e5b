//! Authority Resolver
//!
//! Decides whether a caller may author a change to a party right now.

use crate::sync::{ClientMessage, PartyMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permitted,
    Denied,
}

impl Decision {
    pub fn is_permitted(self) -> bool {
        self == Decision::Permitted
    }
}

/// Playback changes: anyone in democratic mode, otherwise only the host
pub fn resolve(mode: PartyMode, caller_id: &str, host_id: &str) -> Decision {
    if mode == PartyMode::Democratic || caller_id == host_id {
        Decision::Permitted
    } else {
        Decision::Denied
    }
}

/// Party control (mode switch, host transfer) belongs to the host in every mode
pub fn resolve_host_only(caller_id: &str, host_id: &str) -> Decision {
    if caller_id == host_id {
        Decision::Permitted
    } else {
        Decision::Denied
    }
}

/// Authority check for any in-party message
pub fn resolve_message(
    message: &ClientMessage,
    mode: PartyMode,
    caller_id: &str,
    host_id: &str,
) -> Decision {
    match message {
        ClientMessage::SetMode { .. } | ClientMessage::TransferHost { .. } => {
            resolve_host_only(caller_id, host_id)
        }
        _ => resolve(mode, caller_id, host_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PlayerAction;

    #[test]
    fn test_host_mode() {
        assert_eq!(resolve(PartyMode::Host, "host", "host"), Decision::Permitted);
        assert_eq!(resolve(PartyMode::Host, "guest", "host"), Decision::Denied);
    }

    #[test]
    fn test_democratic_mode() {
        assert!(resolve(PartyMode::Democratic, "guest", "host").is_permitted());
    }

    #[test]
    fn test_set_mode_always_host_only() {
        let msg = ClientMessage::SetMode {
            mode: PartyMode::Host,
        };
        assert_eq!(
            resolve_message(&msg, PartyMode::Democratic, "guest", "host"),
            Decision::Denied
        );
        assert_eq!(
            resolve_message(&msg, PartyMode::Democratic, "host", "host"),
            Decision::Permitted
        );

        let play = ClientMessage::PlayerAction(PlayerAction::Play);
        assert!(resolve_message(&play, PartyMode::Democratic, "guest", "host").is_permitted());
    }
}
