//! Party State Management
//!
//! The canonical record of one party. Every mutation runs against a copy,
//! is checked against the party invariants and only then replaces the
//! committed state, bumping `version`.

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::protocol::{
    current_time_ms, Member, MemberId, PartyId, PartyMode, PlayerAction, QueueAction,
    RepeatMode, Snapshot, TrackId,
};
use super::queue::Selection;
use crate::config::HostLeavePolicy;

/// A broken party invariant, detected before commit
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("current index {index} out of range for queue of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("current track id does not match the queue at the current index")]
    TrackMismatch,

    #[error("playing without a current track")]
    PlayingWithoutTrack,

    #[error("host {0} is not a member")]
    HostNotMember(MemberId),

    #[error("shuffled queue is not a permutation of the original order")]
    ShuffleNotPermutation,

    #[error("playback time {0} is negative or not finite")]
    BadTime(f64),
}

/// Errors from party mutations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Track {0} is not in the queue")]
    TrackNotInQueue(TrackId),

    #[error("Queue position {position} is out of range (queue has {len} tracks)")]
    InvalidPosition { position: usize, len: usize },

    #[error("Invalid playback time: {0}")]
    InvalidTime(f64),

    #[error("Invalid volume: {0}")]
    InvalidVolume(f32),

    #[error("Member {0} is not in the party")]
    MemberNotFound(MemberId),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// The "now playing" part of a party
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub queue: Vec<TrackId>,
    /// Pre-shuffle order; empty while not shuffled
    pub original_queue: Vec<TrackId>,
    pub current_index: Option<usize>,
    pub current_track_id: Option<TrackId>,
    /// Seconds
    pub current_time: f64,
    pub is_playing: bool,
    pub repeat_mode: RepeatMode,
    pub is_shuffled: bool,
    pub volume: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            original_queue: Vec::new(),
            current_index: None,
            current_track_id: None,
            current_time: 0.0,
            is_playing: false,
            repeat_mode: RepeatMode::Off,
            is_shuffled: false,
            volume: 1.0,
        }
    }
}

/// Result of removing a member from a party
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// A regular member left
    Left,
    /// The host left and this member took over
    HostPromoted(MemberId),
    /// The party must be removed
    Dissolved,
}

/// A listening party: members around one playback timeline
#[derive(Debug, Clone)]
pub struct Party {
    pub id: PartyId,
    pub host_id: MemberId,
    pub mode: PartyMode,
    /// Join order preserved
    pub members: Vec<Member>,
    pub playback: PlaybackState,
    pub version: u64,
    pub last_actor: Option<MemberId>,
}

impl Party {
    /// Create a party with `host` as its only member
    pub fn new(id: PartyId, host: Member) -> Self {
        Self {
            id,
            host_id: host.id.clone(),
            mode: PartyMode::Host,
            last_actor: Some(host.id.clone()),
            members: vec![host],
            playback: PlaybackState::default(),
            version: 1,
        }
    }

    pub fn is_member(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m.id == member_id)
    }

    pub fn is_host(&self, member_id: &str) -> bool {
        self.host_id == member_id
    }

    pub fn host_name(&self) -> &str {
        self.members
            .iter()
            .find(|m| m.id == self.host_id)
            .map(|m| m.name.as_str())
            .unwrap_or("Unknown")
    }

    /// Immutable copy of the playback-relevant fields
    pub fn snapshot(&self) -> Snapshot {
        let p = &self.playback;
        Snapshot {
            party_id: self.id.clone(),
            version: self.version,
            host_id: self.host_id.clone(),
            mode: self.mode,
            members: self.members.clone(),
            queue: p.queue.clone(),
            current_index: p.current_index.map(|i| i as i64).unwrap_or(-1),
            current_track_id: p.current_track_id.clone(),
            current_time: p.current_time,
            is_playing: p.is_playing,
            repeat_mode: p.repeat_mode,
            is_shuffled: p.is_shuffled,
            volume: p.volume,
            last_actor: self.last_actor.clone(),
            sent_at_ms: current_time_ms(),
        }
    }

    /// Check the five party invariants plus time sanity
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let p = &self.playback;

        match p.current_index {
            Some(index) if index >= p.queue.len() => {
                return Err(InvariantViolation::IndexOutOfRange {
                    index,
                    len: p.queue.len(),
                });
            }
            Some(index) => {
                if p.current_track_id.as_ref() != Some(&p.queue[index]) {
                    return Err(InvariantViolation::TrackMismatch);
                }
            }
            None => {
                if p.current_track_id.is_some() {
                    return Err(InvariantViolation::TrackMismatch);
                }
            }
        }

        if p.is_playing && p.current_track_id.is_none() {
            return Err(InvariantViolation::PlayingWithoutTrack);
        }

        if !self.is_member(&self.host_id) {
            return Err(InvariantViolation::HostNotMember(self.host_id.clone()));
        }

        if p.is_shuffled {
            let mut shuffled = p.queue.clone();
            let mut original = p.original_queue.clone();
            shuffled.sort();
            original.sort();
            if shuffled != original {
                return Err(InvariantViolation::ShuffleNotPermutation);
            }
        }

        if !p.current_time.is_finite() || p.current_time < 0.0 {
            return Err(InvariantViolation::BadTime(p.current_time));
        }

        Ok(())
    }

    /// Apply `change` to a copy, validate, then commit
    fn mutate<F>(&mut self, actor: Option<&str>, change: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Party) -> Result<(), SyncError>,
    {
        let mut next = self.clone();
        change(&mut next)?;

        if let Err(violation) = next.check_invariants() {
            warn!("Party {}: rejected change, {}", self.id, violation);
            return Err(violation.into());
        }

        next.version = self.version + 1;
        next.last_actor = actor.map(str::to_string);
        *self = next;
        Ok(())
    }

    // === Membership ===

    /// Add a member (or refresh their display name)
    pub fn add_member(&mut self, member: Member) -> Result<(), SyncError> {
        self.mutate(None, |party| {
            match party.members.iter_mut().find(|m| m.id == member.id) {
                Some(existing) => existing.name = member.name,
                None => party.members.push(member),
            }
            Ok(())
        })
    }

    /// Remove a member, applying `policy` if it was the host
    pub fn remove_member(
        &mut self,
        member_id: &str,
        policy: HostLeavePolicy,
    ) -> Result<Departure, SyncError> {
        if !self.is_member(member_id) {
            return Err(SyncError::MemberNotFound(member_id.to_string()));
        }

        let remaining = self.members.iter().filter(|m| m.id != member_id).count();
        if remaining == 0 {
            return Ok(Departure::Dissolved);
        }

        let host_leaving = self.is_host(member_id);
        if host_leaving && policy == HostLeavePolicy::Dissolve {
            return Ok(Departure::Dissolved);
        }

        self.mutate(None, |party| {
            party.members.retain(|m| m.id != member_id);
            if host_leaving {
                if let Some(next_host) = party.members.first() {
                    party.host_id = next_host.id.clone();
                }
            }
            Ok(())
        })?;

        if host_leaving {
            debug!("Party {}: host left, promoted {}", self.id, self.host_id);
            Ok(Departure::HostPromoted(self.host_id.clone()))
        } else {
            Ok(Departure::Left)
        }
    }

    pub fn transfer_host(&mut self, actor: &str, new_host: &str) -> Result<(), SyncError> {
        if !self.is_member(new_host) {
            return Err(SyncError::MemberNotFound(new_host.to_string()));
        }
        self.mutate(Some(actor), |party| {
            party.host_id = new_host.to_string();
            Ok(())
        })
    }

    pub fn set_mode(&mut self, actor: &str, mode: PartyMode) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.mode = mode;
            Ok(())
        })
    }

    // === Playback ===

    pub fn apply_player_action(
        &mut self,
        actor: &str,
        action: &PlayerAction,
    ) -> Result<(), SyncError> {
        match action {
            PlayerAction::Play => self.play(actor),
            PlayerAction::Pause => self.pause(actor),
            PlayerAction::Seek { current_time } => self.seek(actor, *current_time),
            PlayerAction::ChangeTrack { track_id } => self.change_track(actor, track_id),
            PlayerAction::NextTrack => self.next_track(actor),
            PlayerAction::PrevTrack => self.prev_track(actor),
            PlayerAction::SetVolume { volume } => self.set_volume(actor, *volume),
        }
    }

    pub fn apply_queue_action(&mut self, actor: &str, action: &QueueAction) -> Result<(), SyncError> {
        match action {
            QueueAction::Add { track_id } => self.add_to_queue(actor, track_id),
            QueueAction::Remove { position } => self.remove_from_queue(actor, *position),
            QueueAction::Clear => self.clear_queue(actor),
        }
    }

    /// Select `track_id` and start it from the beginning
    pub fn change_track(&mut self, actor: &str, track_id: &str) -> Result<(), SyncError> {
        let Some(index) = self.playback.queue.iter().position(|t| t == track_id) else {
            warn!("Party {}: change_track to {} which is not queued", self.id, track_id);
            return Err(SyncError::TrackNotInQueue(track_id.to_string()));
        };
        self.mutate(Some(actor), |party| {
            party.playback.play_index(index);
            Ok(())
        })
    }

    /// Resume; no effect without a current track
    pub fn play(&mut self, actor: &str) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            let p = &mut party.playback;
            p.is_playing = p.current_track_id.is_some();
            Ok(())
        })
    }

    pub fn pause(&mut self, actor: &str) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.playback.is_playing = false;
            Ok(())
        })
    }

    /// Store a new offset; the upper clamp is the client's job
    pub fn seek(&mut self, actor: &str, time: f64) -> Result<(), SyncError> {
        if !time.is_finite() {
            return Err(SyncError::InvalidTime(time));
        }
        self.mutate(Some(actor), |party| {
            if party.playback.current_track_id.is_some() {
                party.playback.current_time = time.max(0.0);
            }
            Ok(())
        })
    }

    pub fn next_track(&mut self, actor: &str) -> Result<(), SyncError> {
        let selection = self.playback.select_next();
        self.apply_selection(actor, selection)
    }

    pub fn prev_track(&mut self, actor: &str) -> Result<(), SyncError> {
        let selection = self.playback.select_prev();
        self.apply_selection(actor, selection)
    }

    fn apply_selection(&mut self, actor: &str, selection: Selection) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            match selection {
                Selection::Play(index) => party.playback.play_index(index),
                Selection::Stop => party.playback.is_playing = false,
                Selection::Nothing => {}
            }
            Ok(())
        })
    }

    pub fn add_to_queue(&mut self, actor: &str, track_id: &str) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.playback.append(track_id.to_string());
            Ok(())
        })
    }

    pub fn remove_from_queue(&mut self, actor: &str, position: usize) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.playback.remove_at(position).map(|_| ())
        })
    }

    pub fn clear_queue(&mut self, actor: &str) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.playback.clear();
            Ok(())
        })
    }

    pub fn set_repeat_mode(&mut self, actor: &str, mode: RepeatMode) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            party.playback.repeat_mode = mode;
            Ok(())
        })
    }

    pub fn toggle_shuffle(&mut self, actor: &str) -> Result<(), SyncError> {
        self.toggle_shuffle_with(actor, &mut rand::thread_rng())
    }

    pub fn toggle_shuffle_with<R: Rng + ?Sized>(
        &mut self,
        actor: &str,
        rng: &mut R,
    ) -> Result<(), SyncError> {
        self.mutate(Some(actor), |party| {
            if party.playback.is_shuffled {
                party.playback.unshuffle();
            } else {
                party.playback.shuffle(rng);
            }
            Ok(())
        })
    }

    pub fn set_volume(&mut self, actor: &str, volume: f32) -> Result<(), SyncError> {
        if !volume.is_finite() {
            return Err(SyncError::InvalidVolume(volume));
        }
        self.mutate(Some(actor), |party| {
            party.playback.volume = volume.clamp(0.0, 1.0);
            Ok(())
        })
    }

    /// Live position heartbeat; ignored while nothing is selected
    pub fn report_position(
        &mut self,
        actor: &str,
        current_time: f64,
        is_playing: bool,
    ) -> Result<(), SyncError> {
        if !current_time.is_finite() {
            return Err(SyncError::InvalidTime(current_time));
        }
        self.mutate(Some(actor), |party| {
            let p = &mut party.playback;
            if p.current_track_id.is_some() {
                p.current_time = current_time.max(0.0);
                p.is_playing = is_playing;
            }
            Ok(())
        })
    }
}
