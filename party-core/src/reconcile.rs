//! Reconciliation Engine
//!
//! Runs on every client for each snapshot it receives and decides which
//! corrections to apply to the local player. Local actions win for a short
//! protection window; after that (or as soon as the server acknowledges
//! them) the client converges on the snapshot.
//!
//! All per-party client state lives in [`ClientSyncContext`], created when
//! the client joins a party and dropped when it leaves.

use std::time::Instant;

use tracing::debug;

use crate::config::SyncConfig;
use crate::sync::{MemberId, PartyId, PartyMode, Snapshot, TrackId};

/// Volume differences below this are not corrected
const VOLUME_EPSILON: f32 = 0.01;

/// What the local player is doing right now
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub track_id: Option<TrackId>,
    /// Seconds
    pub current_time: f64,
    pub is_playing: bool,
    pub volume: f32,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            track_id: None,
            current_time: 0.0,
            is_playing: false,
            volume: 1.0,
        }
    }
}

/// One change to apply to the local player
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    LoadTrack(TrackId),
    Unload,
    Seek(f64),
    Play,
    Pause,
    SetVolume(f32),
}

/// Per-party sync state of one client
#[derive(Debug, Clone)]
pub struct ClientSyncContext {
    local_id: MemberId,
    party_id: PartyId,
    config: SyncConfig,
    mode: PartyMode,
    host_id: MemberId,
    last_local_action_at: Option<Instant>,
    /// Own actions sent but not yet seen in a snapshot
    pending_acks: u32,
    last_applied_version: u64,
    /// Apply the next snapshot even if its version was already seen
    force_next: bool,
    settle_until: Option<Instant>,
    /// A play attempt failed; wait for a user gesture before trying again
    play_blocked: bool,
}

impl ClientSyncContext {
    pub fn new(local_id: impl Into<MemberId>, party_id: impl Into<PartyId>, config: SyncConfig) -> Self {
        Self {
            local_id: local_id.into(),
            party_id: party_id.into(),
            config,
            mode: PartyMode::Host,
            host_id: MemberId::new(),
            last_local_action_at: None,
            pending_acks: 0,
            last_applied_version: 0,
            force_next: false,
            settle_until: None,
            play_blocked: false,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn mode(&self) -> PartyMode {
        self.mode
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn is_host(&self) -> bool {
        self.host_id == self.local_id
    }

    /// Host in host mode: the source of truth, never corrected on play/time
    pub fn is_self_authoritative(&self) -> bool {
        self.mode == PartyMode::Host && self.is_host()
    }

    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version
    }

    pub fn pending_acks(&self) -> u32 {
        self.pending_acks
    }

    pub fn is_play_blocked(&self) -> bool {
        self.play_blocked
    }

    /// Record a user-initiated action that is about to be sent
    pub fn note_local_action(&mut self, now: Instant) {
        self.last_local_action_at = Some(now);
        self.pending_acks = self.pending_acks.saturating_add(1);
        // A user gesture lifts the autoplay block
        self.play_blocked = false;
    }

    /// The server refused our last action; realign with its next snapshot
    pub fn note_rejected(&mut self) {
        self.pending_acks = self.pending_acks.saturating_sub(1);
        if self.pending_acks == 0 {
            self.last_local_action_at = None;
        }
        self.force_next = true;
    }

    pub fn note_play_failed(&mut self) {
        self.play_blocked = true;
    }

    pub fn is_protected(&self, now: Instant) -> bool {
        self.last_local_action_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.protection_window)
    }

    pub fn is_settling(&self, now: Instant) -> bool {
        self.settle_until.is_some_and(|until| now < until)
    }

    /// Whether a local player event should be turned into an outgoing action
    pub fn should_emit(&self, now: Instant) -> bool {
        !self.is_settling(now)
    }

    /// Merge one snapshot into local playback
    pub fn reconcile(&mut self, snapshot: &Snapshot, local: &PlayerState, now: Instant) -> Vec<Correction> {
        if snapshot.party_id != self.party_id {
            debug!("Ignoring snapshot for party {} (in {})", snapshot.party_id, self.party_id);
            return Vec::new();
        }
        if snapshot.version <= self.last_applied_version && !self.force_next {
            debug!(
                "Dropping stale snapshot v{} (applied v{})",
                snapshot.version, self.last_applied_version
            );
            return Vec::new();
        }
        self.force_next = false;
        self.last_applied_version = self.last_applied_version.max(snapshot.version);
        self.mode = snapshot.mode;
        self.host_id = snapshot.host_id.clone();

        if snapshot.last_actor.as_deref() == Some(self.local_id.as_str()) && self.pending_acks > 0 {
            self.pending_acks -= 1;
            if self.pending_acks == 0 {
                self.last_local_action_at = None;
            }
        }

        let protected = self.is_protected(now);
        let mut corrections = Vec::new();
        let mut effective = local.clone();

        // Track convergence
        if snapshot.current_track_id != local.track_id {
            if self.is_self_authoritative() && protected {
                debug!("Host keeps its own recent track choice");
            } else {
                match &snapshot.current_track_id {
                    Some(track_id) => corrections.push(Correction::LoadTrack(track_id.clone())),
                    None => corrections.push(Correction::Unload),
                }
                effective = PlayerState {
                    track_id: snapshot.current_track_id.clone(),
                    current_time: 0.0,
                    is_playing: false,
                    volume: local.volume,
                };
            }
        }

        if self.is_self_authoritative() {
            // A freshly loaded track starts paused; keep the timeline moving
            // when the server selected it playing (next/prev, auto-advance)
            let loaded = corrections.iter().any(|c| matches!(c, Correction::LoadTrack(_)));
            if loaded && snapshot.is_playing && !self.play_blocked {
                corrections.push(Correction::Play);
            }
            self.settle_if_changed(&corrections, now);
            return corrections;
        }

        if snapshot.current_track_id.is_none() {
            self.settle_if_changed(&corrections, now);
            return corrections;
        }

        // Time convergence
        let drift = (effective.current_time - snapshot.current_time).abs();
        let suppressed = protected && drift < self.config.protection_max_drift;
        let tolerance = self.config.tolerance(snapshot.mode);
        if suppressed {
            debug!("Drift {:.2}s suppressed by recent local action", drift);
        } else if drift > tolerance {
            debug!("Drift {:.2}s exceeds {:.1}s, seeking to {:.2}", drift, tolerance, snapshot.current_time);
            corrections.push(Correction::Seek(snapshot.current_time));
        }

        // Play/pause convergence
        if snapshot.is_playing != effective.is_playing && !suppressed {
            if !snapshot.is_playing {
                corrections.push(Correction::Pause);
            } else if self.play_blocked {
                debug!("Play correction skipped until the user interacts");
            } else {
                corrections.push(Correction::Play);
            }
        }

        if (snapshot.volume - local.volume).abs() > VOLUME_EPSILON {
            corrections.push(Correction::SetVolume(snapshot.volume));
        }

        self.settle_if_changed(&corrections, now);
        corrections
    }

    fn settle_if_changed(&mut self, corrections: &[Correction], now: Instant) {
        if !corrections.is_empty() {
            self.settle_until = Some(now + self.config.settle_period);
        }
    }
}
