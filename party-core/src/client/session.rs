//! Party session: one client's connection to the party server

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::authority;
use crate::catalog::{CatalogClient, CatalogTrack};
use crate::config::{LobbyConfig, SyncConfig};
use crate::party_code::PartyCode;
use crate::sync::{
    ClientMessage, Member, MemberId, PartyMode, PartySummary, PlayerAction, QueueAction, RepeatMode,
    ServerMessage, Snapshot, TrackId,
};

use super::handlers::{handle_server_message, stop_heartbeat_loop, SessionState};
use super::types::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client session handle
pub struct PartySession {
    config: SessionConfig,
    state: Arc<SessionState>,
    display_name: Arc<RwLock<String>>,
    catalog: Option<CatalogClient>,
    /// Handle for cancelling the connection loop
    connection_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl PartySession {
    pub fn new(
        config: SessionConfig,
        sync_config: SyncConfig,
        player: Arc<dyn PlaybackPrimitive>,
    ) -> Result<Self, SessionError> {
        let catalog = config
            .catalog_url
            .as_deref()
            .map(CatalogClient::new)
            .transpose()?;

        let state = Arc::new(SessionState::new(
            config.user_id.clone(),
            sync_config,
            config.heartbeat_interval,
            player,
        ));

        Ok(Self {
            display_name: Arc::new(RwLock::new(config.display_name.clone())),
            config,
            state,
            catalog,
            connection_cancel: Mutex::new(None),
        })
    }

    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.state.callback.write() = Some(Arc::from(callback));
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn catalog(&self) -> Option<&CatalogClient> {
        self.catalog.as_ref()
    }

    /// Start the connection loop. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        self.disconnect();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.connection_cancel.lock() = Some(cancel_tx);

        let state = Arc::clone(&self.state);
        let display_name = Arc::clone(&self.display_name);
        let config = self.config.clone();
        tokio::spawn(run_connection(state, config, display_name, cancel_rx));
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self) {
        if let Some(cancel) = self.connection_cancel.lock().take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn party_id(&self) -> Option<String> {
        self.state.party_id()
    }

    pub fn is_in_party(&self) -> bool {
        self.state.party.lock().is_some()
    }

    pub fn is_host(&self) -> bool {
        self.state.party.lock().as_ref().is_some_and(|ctx| ctx.is_host())
    }

    /// Last applied snapshot of the current party
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.state.last_snapshot.read().clone()
    }

    pub fn lobby(&self) -> (Vec<Member>, Vec<PartySummary>) {
        self.state.lobby.read().clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) -> Result<(), SessionError> {
        let name = name.into();
        *self.display_name.write() = name.clone();
        self.state.send(ClientMessage::UserJoin { name })
    }

    pub fn create_party(&self) -> Result<(), SessionError> {
        self.ensure_not_in_party()?;
        self.state.send(ClientMessage::CreateParty {})
    }

    /// Join by code; accepts `ABCD-EFGH`, `abcdefgh` and similar
    pub fn join_party(&self, code: &str) -> Result<(), SessionError> {
        self.ensure_not_in_party()?;
        let code = PartyCode::parse(code).ok_or_else(|| SessionError::InvalidPartyCode(code.to_string()))?;
        info!("Joining party {}", code);
        self.state.send(ClientMessage::JoinParty {
            party_id: code.into_string(),
        })
    }

    pub fn leave_party(&self) -> Result<(), SessionError> {
        if !self.is_in_party() {
            return Err(SessionError::NotInParty);
        }
        // Best effort; the local teardown happens regardless
        if let Err(e) = self.state.send(ClientMessage::LeaveParty {}) {
            debug!("Could not notify server of leave: {}", e);
        }
        self.state.leave_locally("Left the party");
        Ok(())
    }

    /// A user-initiated playback command: applied locally right away, then sent
    pub fn player_action(&self, action: PlayerAction) -> Result<(), SessionError> {
        let message = ClientMessage::PlayerAction(action.clone());
        if self.note_mutation(&message)? {
            self.apply_optimistic(&action);
        }
        self.state.send(message)
    }

    pub fn play(&self) -> Result<(), SessionError> {
        self.player_action(PlayerAction::Play)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.player_action(PlayerAction::Pause)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), SessionError> {
        self.player_action(PlayerAction::Seek { current_time: seconds })
    }

    pub fn change_track(&self, track_id: impl Into<TrackId>) -> Result<(), SessionError> {
        self.player_action(PlayerAction::ChangeTrack {
            track_id: track_id.into(),
        })
    }

    pub fn next_track(&self) -> Result<(), SessionError> {
        self.player_action(PlayerAction::NextTrack)
    }

    pub fn prev_track(&self) -> Result<(), SessionError> {
        self.player_action(PlayerAction::PrevTrack)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.player_action(PlayerAction::SetVolume { volume })
    }

    /// Something the local player did on its own (media keys, track ended).
    ///
    /// Returns `Ok(false)` when the event was swallowed because it was most
    /// likely caused by a correction we just applied.
    pub fn player_event(&self, action: PlayerAction) -> Result<bool, SessionError> {
        let settling = self
            .state
            .party
            .lock()
            .as_ref()
            .is_some_and(|ctx| !ctx.should_emit(Instant::now()));
        if settling {
            debug!("Swallowing player event {} during settle period", action.name());
            return Ok(false);
        }

        let message = ClientMessage::PlayerAction(action);
        self.note_mutation(&message)?;
        self.state.send(message)?;
        Ok(true)
    }

    pub fn queue_action(&self, action: QueueAction) -> Result<(), SessionError> {
        let message = ClientMessage::QueueAction(action);
        self.note_mutation(&message)?;
        self.state.send(message)
    }

    pub fn add_to_queue(&self, track_id: impl Into<TrackId>) -> Result<(), SessionError> {
        self.queue_action(QueueAction::Add {
            track_id: track_id.into(),
        })
    }

    pub fn remove_from_queue(&self, position: usize) -> Result<(), SessionError> {
        self.queue_action(QueueAction::Remove { position })
    }

    pub fn clear_queue(&self) -> Result<(), SessionError> {
        self.queue_action(QueueAction::Clear)
    }

    pub fn toggle_shuffle(&self) -> Result<(), SessionError> {
        let message = ClientMessage::ToggleShuffle {};
        self.note_mutation(&message)?;
        self.state.send(message)
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) -> Result<(), SessionError> {
        let message = ClientMessage::SetRepeatMode { mode };
        self.note_mutation(&message)?;
        self.state.send(message)
    }

    /// Host only
    pub fn set_mode(&self, mode: PartyMode) -> Result<(), SessionError> {
        self.ensure_in_party()?;
        self.state.send(ClientMessage::SetMode { mode })
    }

    /// Host only
    pub fn transfer_host(&self, member_id: impl Into<MemberId>) -> Result<(), SessionError> {
        self.ensure_in_party()?;
        self.state.send(ClientMessage::TransferHost {
            member_id: member_id.into(),
        })
    }

    /// Audio URL for a track, when a catalog is configured
    pub fn stream_url(&self, track_id: &str) -> Option<String> {
        self.catalog.as_ref().map(|c| c.stream_url(track_id))
    }

    /// Append every track of a catalog playlist to the party queue.
    ///
    /// Adds are paced by the party's admission interval so none of them is
    /// rate limited.
    pub async fn enqueue_playlist(&self, playlist_id: &str) -> Result<usize, SessionError> {
        let catalog = self.catalog.as_ref().ok_or(SessionError::NoCatalog)?;
        self.ensure_in_party()?;

        let playlist = catalog.playlist(playlist_id).await?;
        info!("Enqueueing playlist {} ({} tracks)", playlist.title, playlist.tracks.len());

        let intervals = LobbyConfig::default();
        for (i, track_id) in playlist.tracks.iter().enumerate() {
            if i > 0 {
                let mode = self.state.party.lock().as_ref().map(|ctx| ctx.mode()).unwrap_or_default();
                tokio::time::sleep(intervals.action_interval(mode)).await;
            }
            self.add_to_queue(track_id.clone())?;
        }
        Ok(playlist.tracks.len())
    }

    /// Upload a file to the catalog and queue it in the current party
    pub async fn upload_and_enqueue(&self, filename: &str, bytes: Vec<u8>) -> Result<CatalogTrack, SessionError> {
        let catalog = self.catalog.as_ref().ok_or(SessionError::NoCatalog)?;
        self.ensure_in_party()?;

        let track = catalog.upload(filename, bytes).await?;
        self.add_to_queue(track.id.clone())?;
        Ok(track)
    }

    fn ensure_in_party(&self) -> Result<(), SessionError> {
        if self.is_in_party() {
            Ok(())
        } else {
            Err(SessionError::NotInParty)
        }
    }

    fn ensure_not_in_party(&self) -> Result<(), SessionError> {
        if self.is_in_party() {
            Err(SessionError::AlreadyInParty)
        } else {
            Ok(())
        }
    }

    /// Record a playback mutation against the protection window.
    ///
    /// Returns whether the caller is expected to be permitted; the server
    /// still decides.
    fn note_mutation(&self, message: &ClientMessage) -> Result<bool, SessionError> {
        if !self.state.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let mut party = self.state.party.lock();
        let ctx = party.as_mut().ok_or(SessionError::NotInParty)?;
        let permitted = authority::resolve_message(message, ctx.mode(), ctx.local_id(), ctx.host_id())
            .is_permitted();

        if permitted {
            ctx.note_local_action(Instant::now());
        } else {
            debug!("{} will be refused: not permitted in {:?} mode", message.kind(), ctx.mode());
        }
        Ok(permitted)
    }

    fn apply_optimistic(&self, action: &PlayerAction) {
        let player = &self.state.player;
        let result = match action {
            PlayerAction::Play => player.play(),
            PlayerAction::Pause => {
                player.pause();
                Ok(())
            }
            PlayerAction::Seek { current_time } => {
                if current_time.is_finite() {
                    player.seek_to(current_time.max(0.0));
                }
                Ok(())
            }
            PlayerAction::ChangeTrack { track_id } => player.load_track(track_id).and_then(|_| player.play()),
            PlayerAction::SetVolume { volume } => {
                if volume.is_finite() {
                    player.set_volume(volume.clamp(0.0, 1.0));
                }
                Ok(())
            }
            // Queue position is resolved by the server
            PlayerAction::NextTrack | PlayerAction::PrevTrack => Ok(()),
        };

        if let Err(e) = result {
            warn!("Local {} failed: {}", action.name(), e);
            if matches!(action, PlayerAction::Play | PlayerAction::ChangeTrack { .. }) {
                if let Some(ctx) = self.state.party.lock().as_mut() {
                    ctx.note_play_failed();
                }
            }
            if let Some(cb) = self.state.callback() {
                cb.on_playback_error(e);
            }
        }
    }
}

impl Drop for PartySession {
    fn drop(&mut self) {
        self.disconnect();
        stop_heartbeat_loop(&self.state);
    }
}

/// Connect, serve the socket, and reconnect with a fixed delay until the
/// attempt budget runs out or the session is closed
async fn run_connection(
    state: Arc<SessionState>,
    config: SessionConfig,
    display_name: Arc<RwLock<String>>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let url = config.socket_url();
    let mut attempt = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("Connected to {}", url);
                attempt = 0;
                let closed_by_user = serve_socket(&state, socket, &display_name, &mut cancel_rx).await;
                if let Some(cb) = state.callback() {
                    cb.on_disconnected();
                }
                if closed_by_user {
                    info!("Connection closed");
                    break;
                }
                warn!("Connection to {} lost", url);
            }
            Err(e) => warn!("Connection to {} failed: {}", url, e),
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            warn!("Giving up after {} reconnection attempts", config.max_reconnect_attempts);
            state.leave_locally("Connection lost");
            if let Some(cb) = state.callback() {
                cb.on_connection_lost();
            }
            break;
        }

        if let Some(cb) = state.callback() {
            cb.on_reconnecting(attempt);
        }
        debug!(
            "Reconnecting in {:?} (attempt {}/{})",
            config.reconnect_delay, attempt, config.max_reconnect_attempts
        );
        tokio::select! {
            _ = &mut cancel_rx => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

/// Pump one open socket; returns true when closed on request
async fn serve_socket(
    state: &Arc<SessionState>,
    socket: Socket,
    display_name: &RwLock<String>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

    // Register, then rejoin the party we were in before a reconnect
    let _ = tx.send(ClientMessage::UserJoin {
        name: display_name.read().clone(),
    });
    if let Some(party_id) = state.party_id() {
        info!("Rejoining party {}", party_id);
        let _ = tx.send(ClientMessage::JoinParty { party_id });
    }
    *state.outgoing.write() = Some(tx);
    if let Some(cb) = state.callback() {
        cb.on_connected();
    }

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {}: {}", message.kind(), e);
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let closed_by_user = loop {
        tokio::select! {
            _ = &mut *cancel_rx => break true,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(text.as_str()) {
                    Ok(message) => handle_server_message(state, message),
                    Err(e) => warn!("Invalid server message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Socket error: {}", e);
                    break false;
                }
            }
        }
    };

    // Dropping the sender lets the forward task drain and close the sink
    *state.outgoing.write() = None;
    if closed_by_user {
        let _ = forward.await;
    } else {
        forward.abort();
    }
    closed_by_user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::handlers::tests::{snapshot, MockPlayer};
    use crate::sync::ServerMessage;

    fn session(me: &str) -> (PartySession, Arc<MockPlayer>, mpsc::UnboundedReceiver<ClientMessage>) {
        let player = Arc::new(MockPlayer::default());
        let session = PartySession::new(
            SessionConfig::new("ws://127.0.0.1:1", me, me),
            SyncConfig::default(),
            player.clone(),
        )
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        *session.state.outgoing.write() = Some(tx);
        (session, player, rx)
    }

    fn join(session: &PartySession, host: &str) {
        let members = [host, session.user_id()];
        handle_server_message(&session.state, ServerMessage::PartySync(snapshot(1, &members, host)));
    }

    #[tokio::test]
    async fn test_actions_require_party() {
        let (session, _player, _rx) = session("guest");
        assert!(matches!(session.play(), Err(SessionError::NotInParty)));
        assert!(matches!(session.leave_party(), Err(SessionError::NotInParty)));
        assert!(matches!(session.join_party("nope"), Err(SessionError::InvalidPartyCode(_))));
    }

    #[tokio::test]
    async fn test_optimistic_seek_and_protection() {
        let (session, player, mut rx) = session("host");
        join(&session, "host");
        player.calls.lock().clear();

        session.seek(95.0).unwrap();
        assert_eq!(*player.calls.lock(), vec!["seek 95"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::PlayerAction(PlayerAction::Seek { current_time: 95.0 })
        );
        assert!(session.state.party.lock().as_ref().unwrap().is_protected(Instant::now()));
    }

    #[tokio::test]
    async fn test_host_keeps_playing_after_next_track() {
        let (session, player, mut rx) = session("host");
        join(&session, "host");
        assert!(player.state().is_playing);

        session.next_track().unwrap();
        assert_eq!(rx.try_recv().unwrap(), ClientMessage::PlayerAction(PlayerAction::NextTrack));

        let mut advanced = snapshot(2, &["host"], "host");
        advanced.queue = vec!["t1".into(), "t2".into()];
        advanced.current_index = 1;
        advanced.current_track_id = Some("t2".into());
        advanced.current_time = 0.0;
        handle_server_message(&session.state, ServerMessage::PartySync(advanced));

        let state = player.state();
        assert_eq!(state.track_id.as_deref(), Some("t2"));
        assert!(state.is_playing, "calls: {:?}", player.calls.lock());
    }

    #[tokio::test]
    async fn test_denied_action_not_applied_locally() {
        let (session, player, mut rx) = session("guest");
        join(&session, "host");
        player.calls.lock().clear();

        session.pause().unwrap();
        assert!(player.calls.lock().is_empty());
        // Still sent: the server answers with a rejection and a resync
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_player_event_swallowed_while_settling() {
        let (session, _player, mut rx) = session("guest");
        join(&session, "host");
        while rx.try_recv().is_ok() {}

        // The join applied corrections, so the settle period is running
        assert!(!session.player_event(PlayerAction::Pause).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_while_in_party_fails() {
        let (session, _player, _rx) = session("host");
        join(&session, "host");
        assert!(matches!(session.create_party(), Err(SessionError::AlreadyInParty)));

        session.leave_party().unwrap();
        assert!(!session.is_in_party());
        session.create_party().unwrap();
    }

    #[tokio::test]
    async fn test_playlist_requires_catalog() {
        let (session, _player, _rx) = session("host");
        assert!(matches!(session.enqueue_playlist("p").await, Err(SessionError::NoCatalog)));
        assert!(session.stream_url("1").is_none());
    }
}
