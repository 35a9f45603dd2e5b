//! Tunables for the server-side lobby and the client-side sync engine

use std::time::Duration;

use crate::sync::PartyMode;

/// Minimum gap between accepted actions of one caller in host mode
pub const HOST_MODE_ACTION_INTERVAL: Duration = Duration::from_millis(300);

/// Minimum gap between accepted actions of one caller in democratic mode
pub const DEMOCRATIC_MODE_ACTION_INTERVAL: Duration = Duration::from_millis(500);

/// Admission entries older than this are dropped by the cleanup task
pub const ADMISSION_RETENTION: Duration = Duration::from_secs(5);

/// What happens to a party when its host leaves while others remain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostLeavePolicy {
    /// End the party for everyone
    #[default]
    Dissolve,
    /// Hand host to the member who joined earliest
    PromoteNextJoined,
}

impl HostLeavePolicy {
    /// Parse the `HOST_LEAVE_POLICY` setting
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "dissolve" => Some(HostLeavePolicy::Dissolve),
            "promote" | "promote_next_joined" => Some(HostLeavePolicy::PromoteNextJoined),
            _ => None,
        }
    }
}

/// Server-side party configuration
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub host_mode_interval: Duration,
    pub democratic_mode_interval: Duration,
    pub admission_retention: Duration,
    pub host_leave_policy: HostLeavePolicy,
}

impl LobbyConfig {
    pub fn action_interval(&self, mode: PartyMode) -> Duration {
        match mode {
            PartyMode::Host => self.host_mode_interval,
            PartyMode::Democratic => self.democratic_mode_interval,
        }
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            host_mode_interval: HOST_MODE_ACTION_INTERVAL,
            democratic_mode_interval: DEMOCRATIC_MODE_ACTION_INTERVAL,
            admission_retention: ADMISSION_RETENTION,
            host_leave_policy: HostLeavePolicy::default(),
        }
    }
}

/// Client-side reconciliation thresholds
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Drift tolerated before seeking, host mode (seconds)
    pub host_mode_tolerance: f64,
    /// Drift tolerated before seeking, democratic mode (seconds)
    pub democratic_mode_tolerance: f64,
    /// How long a local action outranks incoming snapshots
    pub protection_window: Duration,
    /// Drift beyond which the protection window no longer applies (seconds)
    pub protection_max_drift: f64,
    /// How long own player events are swallowed after a correction
    pub settle_period: Duration,
}

impl SyncConfig {
    pub fn tolerance(&self, mode: PartyMode) -> f64 {
        match mode {
            PartyMode::Host => self.host_mode_tolerance,
            PartyMode::Democratic => self.democratic_mode_tolerance,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host_mode_tolerance: 1.5,
            democratic_mode_tolerance: 4.0,
            protection_window: Duration::from_millis(2000),
            protection_max_drift: 8.0,
            settle_period: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_leave_policy_parse() {
        assert_eq!(HostLeavePolicy::parse("Dissolve"), Some(HostLeavePolicy::Dissolve));
        assert_eq!(
            HostLeavePolicy::parse(" promote "),
            Some(HostLeavePolicy::PromoteNextJoined)
        );
        assert_eq!(HostLeavePolicy::parse("elect"), None);
    }

    #[test]
    fn test_mode_dependent_values() {
        let lobby = LobbyConfig::default();
        assert_eq!(lobby.action_interval(PartyMode::Host), Duration::from_millis(300));
        assert_eq!(lobby.action_interval(PartyMode::Democratic), Duration::from_millis(500));

        let sync = SyncConfig::default();
        assert_eq!(sync.tolerance(PartyMode::Host), 1.5);
        assert_eq!(sync.tolerance(PartyMode::Democratic), 4.0);
    }
}
