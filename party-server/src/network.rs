//! WebSocket serving for the party server

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use party_core::lobby::{Lobby, Outcome};
use party_core::logging::{self, DEFAULT_DIRECTIVES};
use party_core::sync::{ClientMessage, ServerMessage};
use party_core::CatalogClient;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, MAINTENANCE_INTERVAL};
use crate::metrics::{LogLevel, Metrics, ServerStatus};

/// Shared state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub lobby: Arc<Lobby>,
    pub metrics: Arc<RwLock<Metrics>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    debug!("WebSocket upgrade for {}", user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Serve one member connection until it closes
async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let (connection_id, outgoing_rx) = state.lobby.connect(&user_id);
    state.metrics.write().connection_opened(&user_id);

    let (ws_sink, ws_stream) = socket.split();
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, outgoing_rx));

    process_incoming(ws_stream, &user_id, &state).await;

    outgoing_handle.abort();
    state.lobby.disconnect(&user_id, connection_id);
    state.metrics.write().connection_closed(&user_id);
}

/// Forward messages from the member's outbox to the WebSocket
async fn forward_outgoing(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = outgoing_rx.recv().await {
        match msg.to_json() {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("Failed to serialize server message: {}", e),
        }
    }
}

async fn process_incoming(mut ws_stream: SplitStream<WebSocket>, user_id: &str, state: &AppState) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => match ClientMessage::from_json(text.as_str()) {
                Ok(msg) => {
                    let kind = msg.kind();
                    match state.lobby.handle(user_id, msg, Instant::now()) {
                        Outcome::Accepted => debug!("{} from {} accepted", kind, user_id),
                        outcome => debug!("{} from {}: {:?}", kind, user_id, outcome),
                    }
                }
                Err(e) => {
                    debug!("Failed to parse message from {}: {}", user_id, e);
                    state.lobby.reject_malformed(user_id, &e.to_string());
                }
            },
            Ok(Message::Binary(_)) => state.lobby.reject_malformed(user_id, "binary frames are not supported"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for {}: {}", user_id, e);
                break;
            }
        }
    }
}

/// Periodic housekeeping: admission cleanup, lobby titles, dashboard counters
pub fn spawn_maintenance(
    lobby: Arc<Lobby>,
    metrics: Arc<RwLock<Metrics>>,
    catalog: Option<CatalogClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;

            let pruned = lobby.prune_admission(Instant::now());
            if pruned > 0 {
                debug!("Pruned {} admission entries", pruned);
            }

            if let Some(catalog) = &catalog {
                let missing = lobby.missing_titles();
                if !missing.is_empty() {
                    match catalog.titles(&missing).await {
                        Ok(titles) => {
                            if lobby.set_titles(titles) {
                                lobby.broadcast_state_update();
                            }
                        }
                        Err(e) => debug!("Title lookup failed: {}", e),
                    }
                }
            }

            let stats = lobby.stats();
            metrics.write().lobby = stats;
        }
    })
}

/// Bind, start housekeeping and serve until the listener fails
pub async fn run_with_dashboard(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    info!("Party server starting...");

    let catalog = config
        .catalog_url
        .as_deref()
        .map(CatalogClient::new)
        .transpose()?;
    match &catalog {
        Some(c) => info!("Resolving track titles from {}", c.base_url()),
        None => info!("No CATALOG_URL set, lobby will show track ids only"),
    }

    let listen_addr = config.listen_addr();
    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            metrics.write().status = ServerStatus::Error;
            error!("Failed to bind {}: {}", listen_addr, e);
            return Err(e.into());
        }
    };

    let lobby = Arc::new(Lobby::new(config.lobby.clone()));
    {
        let mut m = metrics.write();
        m.listen_addr = Some(listen_addr.clone());
        m.catalog_url = config.catalog_url.clone();
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Host leave policy: {:?}", config.lobby.host_leave_policy));
    }
    info!("Listening on ws://{}/ws/{{user_id}}", listen_addr);

    let maintenance = spawn_maintenance(Arc::clone(&lobby), Arc::clone(&metrics), catalog);
    let state = AppState {
        lobby,
        metrics: Arc::clone(&metrics),
    };

    let result = axum::serve(listener, router(state)).await;
    maintenance.abort();
    if let Err(e) = result {
        warn!("Server stopped: {}", e);
        metrics.write().status = ServerStatus::Error;
        return Err(e.into());
    }
    Ok(())
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    logging::init_tracing(DEFAULT_DIRECTIVES)?;
    run_with_dashboard(config, metrics).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use party_core::client::{PartySession, PlaybackError, PlaybackPrimitive, SessionConfig};
    use party_core::config::{LobbyConfig, SyncConfig};
    use party_core::reconcile::PlayerState;
    use party_core::sync::{ErrorCode, PartyMode, PlayerAction, QueueAction, RejectReason, Snapshot};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_server() -> (String, Arc<Lobby>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let lobby = Arc::new(Lobby::new(LobbyConfig::default()));
        let state = AppState {
            lobby: Arc::clone(&lobby),
            metrics: Arc::new(RwLock::new(Metrics::new())),
        };
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("ws://{}", addr), lobby)
    }

    async fn connect(base: &str, user: &str) -> Client {
        let (client, _) = connect_async(format!("{}/ws/{}", base, user)).await.unwrap();
        client
    }

    async fn send(client: &mut Client, message: &ClientMessage) {
        client
            .send(WsMessage::text(message.to_json().unwrap()))
            .await
            .unwrap();
    }

    /// Next server message matching `pred`, skipping others
    async fn expect<F>(client: &mut Client, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = client.next().await.unwrap().unwrap();
                if let WsMessage::Text(text) = frame {
                    let message = ServerMessage::from_json(text.as_str()).unwrap();
                    if pred(&message) {
                        return message;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for server message")
    }

    async fn expect_sync(client: &mut Client) -> Snapshot {
        match expect(client, |m| matches!(m, ServerMessage::PartySync(_))).await {
            ServerMessage::PartySync(snapshot) => snapshot,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_party_round_trip_over_websocket() {
        let (base, lobby) = start_server().await;
        let mut host = connect(&base, "host").await;
        let mut guest = connect(&base, "guest").await;

        send(&mut host, &ClientMessage::UserJoin { name: "Hana".into() }).await;
        send(&mut host, &ClientMessage::CreateParty {}).await;
        let created = expect_sync(&mut host).await;
        assert_eq!(created.host_id, "host");
        assert_eq!(lobby.party_id_of("host").as_deref(), Some(created.party_id.as_str()));

        send(&mut guest, &ClientMessage::JoinParty { party_id: created.party_id.clone() }).await;
        let joined = expect_sync(&mut guest).await;
        assert_eq!(joined.members.len(), 2);
        assert_eq!(joined.mode, PartyMode::Host);

        // Guests cannot steer a host-mode party
        send(&mut guest, &ClientMessage::PlayerAction(PlayerAction::Pause)).await;
        let rejected = expect(&mut guest, |m| matches!(m, ServerMessage::ActionRejected { .. })).await;
        assert_eq!(rejected, ServerMessage::ActionRejected { reason: RejectReason::NotPermitted });

        // Host changes reach everyone with the same version
        send(&mut host, &ClientMessage::QueueAction(QueueAction::Add { track_id: "7".into() })).await;
        let host_view = match expect(&mut host, |m| matches!(m, ServerMessage::PartySync(s) if !s.queue.is_empty())).await {
            ServerMessage::PartySync(snapshot) => snapshot,
            _ => unreachable!(),
        };
        let guest_view = expect(&mut guest, |m| {
            matches!(m, ServerMessage::PartySync(s) if s.version == host_view.version)
        })
        .await;
        assert_eq!(guest_view, ServerMessage::PartySync(host_view.clone()));
        assert_eq!(host_view.queue, vec!["7"]);
    }

    #[derive(Default)]
    struct TestPlayer {
        state: parking_lot::Mutex<PlayerState>,
    }

    impl PlaybackPrimitive for TestPlayer {
        fn load_track(&self, track_id: &str) -> Result<(), PlaybackError> {
            let mut state = self.state.lock();
            state.track_id = Some(track_id.to_string());
            state.current_time = 0.0;
            state.is_playing = false;
            Ok(())
        }
        fn unload(&self) {
            self.state.lock().track_id = None;
        }
        fn play(&self) -> Result<(), PlaybackError> {
            self.state.lock().is_playing = true;
            Ok(())
        }
        fn pause(&self) {
            self.state.lock().is_playing = false;
        }
        fn seek_to(&self, seconds: f64) {
            self.state.lock().current_time = seconds;
        }
        fn set_volume(&self, volume: f32) {
            self.state.lock().volume = volume;
        }
        fn state(&self) -> PlayerState {
            self.state.lock().clone()
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_sessions_converge_on_host_playback() {
        let (base, _lobby) = start_server().await;

        let host_player = Arc::new(TestPlayer::default());
        let host = PartySession::new(
            SessionConfig::new(&base, "host", "Hana"),
            SyncConfig::default(),
            host_player.clone(),
        )
        .unwrap();
        host.connect();
        wait_until("host connection", || host.is_connected()).await;
        host.create_party().unwrap();
        wait_until("party creation", || host.snapshot().is_some()).await;
        let code = host.party_id().unwrap();

        let guest_player = Arc::new(TestPlayer::default());
        let guest = PartySession::new(
            SessionConfig::new(&base, "guest", "Gil"),
            SyncConfig::default(),
            guest_player.clone(),
        )
        .unwrap();
        guest.connect();
        wait_until("guest connection", || guest.is_connected()).await;
        guest.join_party(&code).unwrap();
        wait_until("guest join", || guest.snapshot().is_some()).await;

        host.add_to_queue("t1").unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        host.change_track("t1").unwrap();

        assert!(host_player.state().is_playing);
        wait_until("guest playback", || {
            let state = guest_player.state();
            state.track_id.as_deref() == Some("t1") && state.is_playing
        })
        .await;

        // Guests are refused in host mode and pulled back to the party state
        guest_player.pause();
        guest.pause().unwrap();
        wait_until("guest resync", || guest_player.state().is_playing).await;

        // Skipping ahead keeps the whole party playing, heartbeats included
        host.add_to_queue("t2").unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        host.next_track().unwrap();
        wait_until("guest on next track", || {
            let state = guest_player.state();
            state.track_id.as_deref() == Some("t2") && state.is_playing
        })
        .await;
        wait_until("host on next track", || {
            let state = host_player.state();
            state.track_id.as_deref() == Some("t2") && state.is_playing
        })
        .await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(host_player.state().is_playing);
        assert!(guest_player.state().is_playing);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error() {
        let (base, _lobby) = start_server().await;
        let mut client = connect(&base, "alice").await;

        client.send(WsMessage::text("{\"type\":\"dance\"}")).await.unwrap();
        let error = expect(&mut client, |m| matches!(m, ServerMessage::Error { .. })).await;
        assert!(matches!(error, ServerMessage::Error { code: ErrorCode::InvalidMessage, .. }));
    }

    #[tokio::test]
    async fn test_host_disconnect_ends_party() {
        let (base, lobby) = start_server().await;
        let mut host = connect(&base, "host").await;
        let mut guest = connect(&base, "guest").await;

        send(&mut host, &ClientMessage::CreateParty {}).await;
        let party_id = expect_sync(&mut host).await.party_id;
        send(&mut guest, &ClientMessage::JoinParty { party_id: party_id.clone() }).await;
        expect_sync(&mut guest).await;

        host.close(None).await.unwrap();
        let ended = expect(&mut guest, |m| matches!(m, ServerMessage::PartyEnded { .. })).await;
        assert_eq!(
            ended,
            ServerMessage::PartyEnded { party_id, reason: "Host left the party".into() }
        );
        assert!(lobby.party_id_of("guest").is_none());
    }
}
