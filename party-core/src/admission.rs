//! Admission Controller
//!
//! Per (party, caller) rate limiting in front of party mutations. A rejected
//! action does not refresh the caller's timestamp, so a burst collapses to at
//! most one accepted action per interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::sync::{MemberId, PartyId};

#[derive(Debug, Default)]
pub struct AdmissionController {
    last_accepted: Mutex<HashMap<(PartyId, MemberId), Instant>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept iff `now - last_accepted >= min_interval`; records `now` on accept
    pub fn check_at(
        &self,
        party_id: &str,
        caller_id: &str,
        min_interval: Duration,
        now: Instant,
    ) -> bool {
        let mut entries = self.last_accepted.lock();
        let key = (party_id.to_string(), caller_id.to_string());

        if let Some(last) = entries.get(&key) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < min_interval {
                debug!(
                    "Admission: {} in {} rejected ({}ms since last, need {}ms)",
                    caller_id,
                    party_id,
                    elapsed.as_millis(),
                    min_interval.as_millis()
                );
                return false;
            }
        }

        entries.insert(key, now);
        true
    }

    /// Drop the caller's entry for a party (on leave)
    pub fn forget(&self, party_id: &str, caller_id: &str) {
        self.last_accepted
            .lock()
            .remove(&(party_id.to_string(), caller_id.to_string()));
    }

    /// Drop every entry of a party (on dissolve)
    pub fn forget_party(&self, party_id: &str) {
        self.last_accepted.lock().retain(|(party, _), _| party != party_id);
    }

    /// Drop entries older than `retention`; returns how many were removed
    pub fn prune(&self, retention: Duration, now: Instant) -> usize {
        let mut entries = self.last_accepted.lock();
        let before = entries.len();
        entries.retain(|_, last| now.saturating_duration_since(*last) <= retention);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.last_accepted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(300);

    #[test]
    fn test_burst_collapses_to_one() {
        let admission = AdmissionController::new();
        let start = Instant::now();

        let results: Vec<bool> = (0..3)
            .map(|i| admission.check_at("p", "alice", INTERVAL, start + Duration::from_millis(50 * i)))
            .collect();
        assert_eq!(results, vec![true, false, false]);
    }

    #[test]
    fn test_rejection_does_not_refresh_timestamp() {
        let admission = AdmissionController::new();
        let start = Instant::now();

        assert!(admission.check_at("p", "alice", INTERVAL, start));
        assert!(!admission.check_at("p", "alice", INTERVAL, start + Duration::from_millis(250)));
        // Measured from the accepted action, not the rejected one
        assert!(admission.check_at("p", "alice", INTERVAL, start + Duration::from_millis(300)));
    }

    #[test]
    fn test_callers_and_parties_are_independent() {
        let admission = AdmissionController::new();
        let now = Instant::now();

        assert!(admission.check_at("p", "alice", INTERVAL, now));
        assert!(admission.check_at("p", "bob", INTERVAL, now));
        assert!(admission.check_at("q", "alice", INTERVAL, now));
    }

    #[test]
    fn test_prune_and_forget() {
        let admission = AdmissionController::new();
        let start = Instant::now();

        admission.check_at("p", "alice", INTERVAL, start);
        admission.check_at("p", "bob", INTERVAL, start + Duration::from_secs(4));
        admission.check_at("q", "carol", INTERVAL, start + Duration::from_secs(4));

        let removed = admission.prune(Duration::from_secs(5), start + Duration::from_secs(6));
        assert_eq!(removed, 1);
        assert_eq!(admission.len(), 2);

        admission.forget("p", "bob");
        admission.forget_party("q");
        assert!(admission.is_empty());
    }
}
