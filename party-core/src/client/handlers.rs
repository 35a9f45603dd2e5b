//! Server message handlers and the host heartbeat loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::reconcile::{ClientSyncContext, Correction};
use crate::sync::{ClientMessage, ErrorCode, Member, MemberId, PartyId, PartySummary, ServerMessage, Snapshot};

use super::types::{PlaybackError, PlaybackPrimitive, SessionCallback, SessionError};

/// State shared between the session handle, the socket task and the
/// heartbeat loop
pub(super) struct SessionState {
    pub local_id: MemberId,
    pub sync_config: SyncConfig,
    pub heartbeat_interval: Duration,
    pub player: Arc<dyn PlaybackPrimitive>,
    pub callback: RwLock<Option<Arc<dyn SessionCallback>>>,
    /// Outgoing queue of the live connection, if any
    pub outgoing: RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>,
    /// Sync context of the current party; `None` outside a party
    pub party: Mutex<Option<ClientSyncContext>>,
    pub last_snapshot: RwLock<Option<Snapshot>>,
    pub lobby: RwLock<(Vec<Member>, Vec<PartySummary>)>,
    pub heartbeat_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl SessionState {
    pub fn new(
        local_id: MemberId,
        sync_config: SyncConfig,
        heartbeat_interval: Duration,
        player: Arc<dyn PlaybackPrimitive>,
    ) -> Self {
        Self {
            local_id,
            sync_config,
            heartbeat_interval,
            player,
            callback: RwLock::new(None),
            outgoing: RwLock::new(None),
            party: Mutex::new(None),
            last_snapshot: RwLock::new(None),
            lobby: RwLock::new((Vec::new(), Vec::new())),
            heartbeat_cancel: Mutex::new(None),
        }
    }

    pub fn callback(&self) -> Option<Arc<dyn SessionCallback>> {
        self.callback.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.outgoing.read().is_some()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        let outgoing = self.outgoing.read();
        let tx = outgoing.as_ref().ok_or(SessionError::NotConnected)?;
        tx.send(message).map_err(|_| SessionError::NotConnected)
    }

    pub fn party_id(&self) -> Option<PartyId> {
        self.party.lock().as_ref().map(|ctx| ctx.party_id().to_string())
    }

    /// Drop all per-party state and stop the local player
    pub fn leave_locally(&self, reason: &str) {
        stop_heartbeat_loop(self);
        let left = self.party.lock().take();
        *self.last_snapshot.write() = None;

        if let Some(ctx) = left {
            info!("Left party {}: {}", ctx.party_id(), reason);
            self.player.pause();
            if let Some(cb) = self.callback() {
                cb.on_party_left(reason.to_string());
            }
        }
    }
}

/// Handle one message from the party server
pub(super) fn handle_server_message(state: &Arc<SessionState>, message: ServerMessage) {
    match message {
        ServerMessage::PartySync(snapshot) => handle_party_sync(state, snapshot),

        ServerMessage::StateUpdate { users, parties } => {
            debug!("Lobby: {} users, {} parties", users.len(), parties.len());
            *state.lobby.write() = (users.clone(), parties.clone());
            if let Some(cb) = state.callback() {
                cb.on_lobby_changed(users, parties);
            }
        }

        ServerMessage::ActionRejected { reason } => {
            debug!("Action rejected: {:?}", reason);
            if let Some(ctx) = state.party.lock().as_mut() {
                ctx.note_rejected();
            }
            if let Some(cb) = state.callback() {
                cb.on_action_rejected(reason);
            }
        }

        ServerMessage::Error { code, message } => {
            warn!("Server error {:?}: {}", code, message);
            match code {
                ErrorCode::PartyNotFound => state.leave_locally("Party not found"),
                ErrorCode::TrackNotInQueue
                | ErrorCode::InvalidPosition
                | ErrorCode::InvalidTime
                | ErrorCode::Internal => {
                    if let Some(ctx) = state.party.lock().as_mut() {
                        ctx.note_rejected();
                    }
                }
                _ => {}
            }
            if let Some(cb) = state.callback() {
                cb.on_error(code, message);
            }
        }

        ServerMessage::PartyEnded { party_id, reason } => {
            if state.party_id().as_deref() == Some(party_id.as_str()) {
                state.leave_locally(&reason);
            } else {
                debug!("Ignoring end of party {} we are not in", party_id);
            }
        }
    }
}

fn handle_party_sync(state: &Arc<SessionState>, snapshot: Snapshot) {
    if !snapshot.members.iter().any(|m| m.id == state.local_id) {
        debug!("Snapshot for {} does not list us, ignoring", snapshot.party_id);
        return;
    }

    let (applied, authoritative, errors) = {
        let mut party = state.party.lock();
        let switching = party
            .as_ref()
            .map_or(true, |ctx| ctx.party_id() != snapshot.party_id);
        if switching {
            info!("Joined party {}", snapshot.party_id);
            *party = Some(ClientSyncContext::new(
                state.local_id.clone(),
                snapshot.party_id.clone(),
                state.sync_config.clone(),
            ));
        }
        let Some(ctx) = party.as_mut() else { return };

        let corrections = ctx.reconcile(&snapshot, &state.player.state(), Instant::now());
        if !corrections.is_empty() {
            debug!("Applying corrections: {:?}", corrections);
        }
        let errors = apply_corrections(state.player.as_ref(), ctx, &corrections);
        (
            ctx.last_applied_version() == snapshot.version,
            ctx.is_self_authoritative(),
            errors,
        )
    };

    if authoritative {
        if !heartbeat_running(state) {
            start_heartbeat_loop(state);
        }
    } else {
        stop_heartbeat_loop(state);
    }

    let cb = state.callback();
    for error in errors {
        warn!("Playback error: {}", error);
        if let Some(cb) = &cb {
            cb.on_playback_error(error);
        }
    }

    if applied {
        *state.last_snapshot.write() = Some(snapshot.clone());
        if let Some(cb) = &cb {
            cb.on_party_synced(snapshot);
        }
    }
}

/// Apply corrections in order; a failed load aborts the rest
pub(super) fn apply_corrections(
    player: &dyn PlaybackPrimitive,
    ctx: &mut ClientSyncContext,
    corrections: &[Correction],
) -> Vec<PlaybackError> {
    let mut errors = Vec::new();

    for correction in corrections {
        match correction {
            Correction::LoadTrack(track_id) => {
                if let Err(e) = player.load_track(track_id) {
                    errors.push(e);
                    break;
                }
            }
            Correction::Unload => player.unload(),
            Correction::Seek(seconds) => player.seek_to(*seconds),
            Correction::Play => {
                if let Err(e) = player.play() {
                    ctx.note_play_failed();
                    errors.push(e);
                }
            }
            Correction::Pause => player.pause(),
            Correction::SetVolume(volume) => player.set_volume(*volume),
        }
    }

    errors
}

fn heartbeat_running(state: &SessionState) -> bool {
    state
        .heartbeat_cancel
        .lock()
        .as_ref()
        .is_some_and(|tx| !tx.is_closed())
}

/// Start the host position report loop
pub(super) fn start_heartbeat_loop(state: &Arc<SessionState>) {
    // Stop any existing loop first
    stop_heartbeat_loop(state);

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *state.heartbeat_cancel.lock() = Some(cancel_tx);

    let state = Arc::clone(state);
    tokio::spawn(async move {
        info!("Host heartbeat loop started");

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    info!("Host heartbeat loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(state.heartbeat_interval) => {}
            }

            let settling = {
                let party = state.party.lock();
                match party.as_ref() {
                    Some(ctx) if ctx.is_self_authoritative() => ctx.is_settling(Instant::now()),
                    _ => {
                        debug!("No longer host, stopping heartbeat loop");
                        break;
                    }
                }
            };
            if settling {
                continue;
            }

            let player = state.player.state();
            if player.track_id.is_none() {
                continue;
            }

            let report = ClientMessage::SyncUpdate {
                current_time: player.current_time,
                is_playing: player.is_playing,
            };
            if state.send(report).is_err() {
                debug!("Not connected, skipping heartbeat");
            }
        }
    });
}

pub(super) fn stop_heartbeat_loop(state: &SessionState) {
    if let Some(cancel) = state.heartbeat_cancel.lock().take() {
        let _ = cancel.send(());
    }
}
