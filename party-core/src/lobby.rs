//! Lobby
//!
//! Owns every party on the server. Each party sits behind its own mutex, so
//! all changes to one party are serialized: authority check, admission,
//! mutation, snapshot and fan-out happen under that lock. The party map lock
//! is never held while waiting for a party lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::authority;
use crate::broadcast::Broadcaster;
use crate::config::LobbyConfig;
use crate::party_code::PartyCode;
use crate::sync::{
    ClientMessage, Departure, ErrorCode, Member, MemberId, Party, PartyId, PartySummary,
    RejectReason, ServerMessage, SyncError, TrackId,
};

const DEFAULT_NAME: &str = "Anonymous";

/// `None` once the party has been dissolved
type PartyCell = Arc<Mutex<Option<Party>>>;

/// What happened to one client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Committed (or a lobby operation that succeeded)
    Accepted,
    /// Authority denied the caller
    Denied,
    /// Admission rejected the caller
    RateLimited,
    /// Validation or lookup failed; an error was sent back
    Failed(ErrorCode),
}

/// Counters for dashboards
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    denied: AtomicU64,
    rate_limited: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LobbyStats {
    pub accepted: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub failed: u64,
    pub parties: usize,
    pub users: usize,
}

pub struct Lobby {
    config: LobbyConfig,
    parties: RwLock<HashMap<PartyId, PartyCell>>,
    /// Connected users in connection order
    users: RwLock<Vec<Member>>,
    membership: RwLock<HashMap<MemberId, PartyId>>,
    titles: RwLock<HashMap<TrackId, String>>,
    admission: AdmissionController,
    broadcaster: Broadcaster,
    counters: Counters,
}

impl Lobby {
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            config,
            parties: RwLock::new(HashMap::new()),
            users: RwLock::new(Vec::new()),
            membership: RwLock::new(HashMap::new()),
            titles: RwLock::new(HashMap::new()),
            admission: AdmissionController::new(),
            broadcaster: Broadcaster::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    // === Connections ===

    /// Register a user connection. Returns the connection id and its outbox.
    pub fn connect(&self, user_id: &str) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let (connection_id, rx) = self.broadcaster.register(user_id);
        {
            let mut users = self.users.write();
            if !users.iter().any(|u| u.id == user_id) {
                users.push(Member {
                    id: user_id.to_string(),
                    name: DEFAULT_NAME.to_string(),
                });
            }
        }
        info!("User connected: {}", user_id);
        self.broadcast_state_update();
        (connection_id, rx)
    }

    /// Tear down a connection. A disconnect counts as leaving the party.
    pub fn disconnect(&self, user_id: &str, connection_id: u64) {
        if !self.broadcaster.unregister(user_id, connection_id) {
            debug!("Stale disconnect for {} ignored", user_id);
            return;
        }
        self.remove_from_party(user_id, "disconnected");
        self.users.write().retain(|u| u.id != user_id);
        info!("User disconnected: {}", user_id);
        self.broadcast_state_update();
    }

    // === Messages ===

    /// Handle one message from `caller`
    pub fn handle(&self, caller: &str, message: ClientMessage, now: Instant) -> Outcome {
        let outcome = match message {
            ClientMessage::UserJoin { name } => self.set_name(caller, name),
            ClientMessage::CreateParty {} => self.create_party(caller),
            ClientMessage::JoinParty { party_id } => self.join_party(caller, &party_id),
            ClientMessage::LeaveParty {} => self.leave_party(caller),
            other => self.handle_party_message(caller, other, now),
        };

        let counter = match &outcome {
            Outcome::Accepted => &self.counters.accepted,
            Outcome::Denied => &self.counters.denied,
            Outcome::RateLimited => &self.counters.rate_limited,
            Outcome::Failed(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Tell a client its message could not be parsed
    pub fn reject_malformed(&self, caller: &str, detail: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.send_error(caller, ErrorCode::InvalidMessage, format!("Invalid message: {}", detail));
    }

    fn set_name(&self, caller: &str, name: String) -> Outcome {
        let name = match name.trim() {
            "" => DEFAULT_NAME.to_string(),
            trimmed => trimmed.to_string(),
        };

        {
            let mut users = self.users.write();
            match users.iter_mut().find(|u| u.id == caller) {
                Some(user) => user.name = name.clone(),
                None => users.push(Member {
                    id: caller.to_string(),
                    name: name.clone(),
                }),
            }
        }

        if let Some(cell) = self.party_of(caller) {
            let mut guard = cell.lock();
            if let Some(party) = guard.as_mut() {
                let renamed = Member {
                    id: caller.to_string(),
                    name,
                };
                if party.add_member(renamed).is_ok() {
                    self.fan_out_snapshot(party);
                }
            }
        }

        self.broadcast_state_update();
        Outcome::Accepted
    }

    fn create_party(&self, caller: &str) -> Outcome {
        if self.membership.read().contains_key(caller) {
            return self.fail(caller, ErrorCode::AlreadyInParty, "Leave your current party first");
        }

        let host = Member {
            id: caller.to_string(),
            name: self.user_name(caller),
        };

        let party_id = {
            let mut parties = self.parties.write();
            let mut code = PartyCode::random();
            while parties.contains_key(code.as_str()) {
                code = PartyCode::random();
            }
            let party_id = code.into_string();
            let party = Party::new(party_id.clone(), host);
            self.send_to(caller, ServerMessage::PartySync(party.snapshot()));
            parties.insert(party_id.clone(), Arc::new(Mutex::new(Some(party))));
            party_id
        };

        self.membership.write().insert(caller.to_string(), party_id.clone());
        info!("Party {} created by {}", party_id, caller);
        self.broadcast_state_update();
        Outcome::Accepted
    }

    fn join_party(&self, caller: &str, raw_party_id: &str) -> Outcome {
        let Some(code) = PartyCode::parse(raw_party_id) else {
            return self.fail(caller, ErrorCode::PartyNotFound, "Party not found");
        };
        let party_id = code.into_string();

        let current_party = self.party_id_of(caller);
        match current_party {
            Some(current) if current == party_id => {
                // Already there: just resend the state
                if let Some(cell) = self.party_cell(&party_id) {
                    if let Some(party) = cell.lock().as_ref() {
                        self.send_to(caller, ServerMessage::PartySync(party.snapshot()));
                    }
                }
                return Outcome::Accepted;
            }
            Some(_) => {
                return self.fail(caller, ErrorCode::AlreadyInParty, "Leave your current party first");
            }
            None => {}
        }

        let Some(cell) = self.party_cell(&party_id) else {
            return self.fail(caller, ErrorCode::PartyNotFound, "Party not found");
        };

        {
            let mut guard = cell.lock();
            let Some(party) = guard.as_mut() else {
                drop(guard);
                return self.fail(caller, ErrorCode::PartyNotFound, "Party not found");
            };
            let member = Member {
                id: caller.to_string(),
                name: self.user_name(caller),
            };
            if let Err(err) = party.add_member(member) {
                drop(guard);
                return self.fail_sync(caller, &err);
            }
            self.membership.write().insert(caller.to_string(), party_id.clone());
            self.fan_out_snapshot(party);
        }

        info!("{} joined party {}", caller, party_id);
        self.broadcast_state_update();
        Outcome::Accepted
    }

    fn leave_party(&self, caller: &str) -> Outcome {
        if !self.remove_from_party(caller, "left") {
            return self.fail(caller, ErrorCode::NotInParty, "You are not in a party");
        }
        self.broadcast_state_update();
        Outcome::Accepted
    }

    /// Remove `member_id` from its party, applying the host leave policy.
    /// Returns false if the member was not in a party.
    fn remove_from_party(&self, member_id: &str, why: &str) -> bool {
        let Some(party_id) = self.membership.write().remove(member_id) else {
            return false;
        };
        self.admission.forget(&party_id, member_id);

        let Some(cell) = self.party_cell(&party_id) else {
            return true;
        };

        let mut guard = cell.lock();
        let Some(party) = guard.as_mut() else {
            return true;
        };

        match party.remove_member(member_id, self.config.host_leave_policy) {
            Ok(Departure::Left) => {
                info!("{} {} party {}", member_id, why, party_id);
                self.fan_out_snapshot(party);
            }
            Ok(Departure::HostPromoted(new_host)) => {
                info!("Host {} {} party {}, {} is now host", member_id, why, party_id, new_host);
                self.fan_out_snapshot(party);
            }
            Ok(Departure::Dissolved) => {
                let remaining: Vec<MemberId> = party
                    .members
                    .iter()
                    .filter(|m| m.id != member_id)
                    .map(|m| m.id.clone())
                    .collect();
                let reason = if remaining.is_empty() {
                    "Party is empty"
                } else {
                    "Host left the party"
                };

                *guard = None;
                drop(guard);
                self.parties.write().remove(&party_id);
                {
                    let mut membership = self.membership.write();
                    for id in &remaining {
                        membership.remove(id);
                    }
                }
                self.admission.forget_party(&party_id);

                let ended = ServerMessage::PartyEnded {
                    party_id: party_id.clone(),
                    reason: reason.to_string(),
                };
                self.broadcaster
                    .fan_out(remaining.iter().map(String::as_str), &ended);
                info!("Party {} dissolved ({})", party_id, reason);
            }
            Err(err) => {
                warn!("Could not remove {} from party {}: {}", member_id, party_id, err);
            }
        }
        true
    }

    fn handle_party_message(&self, caller: &str, message: ClientMessage, now: Instant) -> Outcome {
        let Some(cell) = self.party_of(caller) else {
            return self.fail(caller, ErrorCode::NotInParty, "You are not in a party");
        };

        let mut guard = cell.lock();
        let Some(party) = guard.as_mut() else {
            drop(guard);
            return self.fail(caller, ErrorCode::PartyNotFound, "Party not found");
        };

        let decision = authority::resolve_message(&message, party.mode, caller, &party.host_id);
        if !decision.is_permitted() {
            debug!("{} denied {} in party {}", caller, message.kind(), party.id);
            self.reject(caller, party, RejectReason::NotPermitted);
            return Outcome::Denied;
        }

        let needs_admission = match &message {
            ClientMessage::SyncUpdate { .. } => !party.is_host(caller),
            other => other.is_playback_mutation(),
        };
        if needs_admission {
            let interval = self.config.action_interval(party.mode);
            if !self.admission.check_at(&party.id, caller, interval, now) {
                self.reject(caller, party, RejectReason::RateLimited);
                return Outcome::RateLimited;
            }
        }

        let summary_before = summary_key(party);
        let result = match &message {
            ClientMessage::PlayerAction(action) => party.apply_player_action(caller, action),
            ClientMessage::QueueAction(action) => party.apply_queue_action(caller, action),
            ClientMessage::ToggleShuffle {} => party.toggle_shuffle(caller),
            ClientMessage::SetRepeatMode { mode } => party.set_repeat_mode(caller, *mode),
            ClientMessage::SetMode { mode } => party.set_mode(caller, *mode),
            ClientMessage::TransferHost { member_id } => party.transfer_host(caller, member_id),
            ClientMessage::SyncUpdate {
                current_time,
                is_playing,
            } => party.report_position(caller, *current_time, *is_playing),
            ClientMessage::UserJoin { .. }
            | ClientMessage::CreateParty {}
            | ClientMessage::JoinParty { .. }
            | ClientMessage::LeaveParty {} => return Outcome::Accepted,
        };

        match result {
            Ok(()) => {
                if !matches!(message, ClientMessage::SyncUpdate { .. }) {
                    debug!("{} applied {} in party {} (v{})", caller, message.kind(), party.id, party.version);
                }
                self.fan_out_snapshot(party);
                let lobby_changed = summary_key(party) != summary_before;
                drop(guard);
                if lobby_changed {
                    self.broadcast_state_update();
                }
                Outcome::Accepted
            }
            Err(err) => {
                warn!("{} failed {} in party {}: {}", caller, message.kind(), party.id, err);
                self.send_error(caller, error_code(&err), err.to_string());
                self.resync(caller, party);
                Outcome::Failed(error_code(&err))
            }
        }
    }

    // === Lobby view ===

    /// Roster and party list as sent in `state_update`
    pub fn state_update(&self) -> ServerMessage {
        let users = self.users.read().clone();
        let cells: Vec<PartyCell> = self.parties.read().values().cloned().collect();
        let titles = self.titles.read().clone();

        let mut parties: Vec<PartySummary> = cells
            .iter()
            .filter_map(|cell| {
                let guard = cell.lock();
                let party = guard.as_ref()?;
                let current = party.playback.current_track_id.clone();
                Some(PartySummary {
                    party_id: party.id.clone(),
                    host_name: party.host_name().to_string(),
                    member_count: party.members.len(),
                    current_track_title: current.as_ref().and_then(|id| titles.get(id).cloned()),
                    current_track_id: current,
                    mode: party.mode,
                })
            })
            .collect();
        parties.sort_by(|a, b| a.party_id.cmp(&b.party_id));

        ServerMessage::StateUpdate { users, parties }
    }

    pub fn broadcast_state_update(&self) {
        let update = self.state_update();
        self.broadcaster.broadcast_all(&update);
    }

    /// Current tracks whose display title is not known yet
    pub fn missing_titles(&self) -> Vec<TrackId> {
        let cells: Vec<PartyCell> = self.parties.read().values().cloned().collect();
        let titles = self.titles.read();
        let mut missing: Vec<TrackId> = cells
            .iter()
            .filter_map(|cell| cell.lock().as_ref()?.playback.current_track_id.clone())
            .filter(|id| !titles.contains_key(id))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Remember display titles; returns true if anything new was learned
    pub fn set_titles(&self, resolved: impl IntoIterator<Item = (TrackId, String)>) -> bool {
        let mut titles = self.titles.write();
        let mut changed = false;
        for (id, title) in resolved {
            if titles.get(&id) != Some(&title) {
                titles.insert(id, title);
                changed = true;
            }
        }
        changed
    }

    /// Drop stale admission entries
    pub fn prune_admission(&self, now: Instant) -> usize {
        self.admission.prune(self.config.admission_retention, now)
    }

    pub fn snapshot_of(&self, party_id: &str) -> Option<crate::sync::Snapshot> {
        let cell = self.party_cell(party_id)?;
        let guard = cell.lock();
        guard.as_ref().map(Party::snapshot)
    }

    pub fn party_id_of(&self, member_id: &str) -> Option<PartyId> {
        self.membership.read().get(member_id).cloned()
    }

    pub fn stats(&self) -> LobbyStats {
        LobbyStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            parties: self.parties.read().len(),
            users: self.users.read().len(),
        }
    }

    // === Helpers ===

    fn party_cell(&self, party_id: &str) -> Option<PartyCell> {
        self.parties.read().get(party_id).cloned()
    }

    fn party_of(&self, member_id: &str) -> Option<PartyCell> {
        let party_id = self.party_id_of(member_id)?;
        self.party_cell(&party_id)
    }

    fn user_name(&self, user_id: &str) -> String {
        self.users
            .read()
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| DEFAULT_NAME.to_string())
    }

    fn send_to(&self, member_id: &str, message: ServerMessage) {
        if let Err(e) = self.broadcaster.send_to(member_id, message) {
            debug!("Dropped message for {}: {}", member_id, e);
        }
    }

    fn fan_out_snapshot(&self, party: &Party) {
        let message = ServerMessage::PartySync(party.snapshot());
        self.broadcaster
            .fan_out(party.members.iter().map(|m| m.id.as_str()), &message);
    }

    /// Re-send the current state to one member so it can realign
    fn resync(&self, caller: &str, party: &Party) {
        self.send_to(caller, ServerMessage::PartySync(party.snapshot()));
    }

    fn reject(&self, caller: &str, party: &Party, reason: RejectReason) {
        self.send_to(caller, ServerMessage::ActionRejected { reason });
        self.resync(caller, party);
    }

    fn send_error(&self, caller: &str, code: ErrorCode, message: impl Into<String>) {
        self.send_to(caller, ServerMessage::error(code, message));
    }

    fn fail(&self, caller: &str, code: ErrorCode, message: &str) -> Outcome {
        self.send_error(caller, code, message);
        Outcome::Failed(code)
    }

    fn fail_sync(&self, caller: &str, err: &SyncError) -> Outcome {
        self.fail(caller, error_code(err), &err.to_string())
    }
}

impl Default for Lobby {
    fn default() -> Self {
        Self::new(LobbyConfig::default())
    }
}

/// The parts of a party the lobby list shows
fn summary_key(party: &Party) -> (Option<TrackId>, crate::sync::PartyMode, MemberId, usize) {
    (
        party.playback.current_track_id.clone(),
        party.mode,
        party.host_id.clone(),
        party.members.len(),
    )
}

fn error_code(err: &SyncError) -> ErrorCode {
    match err {
        SyncError::TrackNotInQueue(_) => ErrorCode::TrackNotInQueue,
        SyncError::InvalidPosition { .. } => ErrorCode::InvalidPosition,
        SyncError::InvalidTime(_) => ErrorCode::InvalidTime,
        SyncError::InvalidVolume(_) => ErrorCode::InvalidMessage,
        SyncError::MemberNotFound(_) => ErrorCode::MemberNotFound,
        SyncError::Invariant(_) => ErrorCode::Internal,
    }
}
