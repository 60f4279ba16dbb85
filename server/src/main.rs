use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

mod config;
mod error;
mod protocol;
mod routes;
mod state;

use config::ServerConfig;
use error::RoomError;
use protocol::{Message, PresenceEvent};
use state::{current_unix_millis, ServerState, UserIdentity};

type ClientSender = mpsc::UnboundedSender<Message>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone)]
pub(crate) struct AppState {
    server_state: ServerState,
    client_senders: ClientSenders,
}

impl AppState {
    fn new(config: &ServerConfig) -> Self {
        Self {
            server_state: ServerState::new(config),
            client_senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_server=debug,info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app_state = AppState::new(&config);
    if let Some(path) = &config.catalog_path {
        match app_state.server_state.load_catalog(path) {
            Ok(count) => tracing::info!(
                "Loaded {} catalog videos from {}",
                count,
                path.display()
            ),
            Err(e) => tracing::warn!("Catalog not loaded: {:#}", e),
        }
    }

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .route("/rooms", get(routes::list_rooms).post(routes::create_room))
        .route("/rooms/:room_id", get(routes::get_room))
        .route("/rooms/:room_id/neighbor", get(routes::neighbor_room))
        .route("/categories/:slug/room", post(routes::category_room))
        .route(
            "/categories/:slug/videos",
            get(routes::category_videos).post(routes::add_category_video),
        )
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        "Watchparty server listening on {} (room capacity {})",
        addr,
        config.room_capacity
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    state.server_state.add_client(client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    state.client_senders.write().await.insert(client_id, tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) = handle_message(&text, client_id, &state).await {
                    tracing::warn!("Rejected message from {}: {}", client_id, e);
                    let _ = tx.send(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    state.client_senders.write().await.remove(&client_id);
    if let Some(room_id) = state.server_state.remove_client(client_id).await {
        broadcast_presence(&state, &room_id, PresenceEvent::Leave).await;
    }
    send_task.abort();
}

async fn handle_message(text: &str, client_id: Uuid, state: &AppState) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::JoinRoom {
            room_id,
            user_id,
            user_name,
            user_image,
            passcode,
        } => {
            let user = UserIdentity {
                user_id,
                user_name,
                user_image,
            };
            match state
                .server_state
                .join_room(client_id, &room_id, user, passcode)
                .await
            {
                Ok(outcome) => {
                    if let Some(previous) = &outcome.previous_room {
                        broadcast_presence(state, previous, PresenceEvent::Leave).await;
                    }
                    send_to(
                        state,
                        client_id,
                        Message::RoomJoined {
                            room: outcome.room,
                            client_id,
                            state: outcome.state,
                            server_time: current_unix_millis(),
                            chat: outcome.chat,
                        },
                    )
                    .await;
                    broadcast_presence(state, &room_id, PresenceEvent::Join).await;
                }
                Err(RoomError::NotFound) => send_to(state, client_id, Message::RoomNotFound).await,
                Err(e) => return Err(e.into()),
            }
        }

        Message::LeaveRoom => {
            if let Some(room_id) = state.server_state.leave_room(client_id).await {
                broadcast_presence(state, &room_id, PresenceEvent::Leave).await;
            }
            send_to(state, client_id, Message::RoomLeft).await;
        }

        Message::VideoState(playback) => {
            let (room_id, stamped) = state.server_state.publish_state(client_id, playback)?;
            let members = state.server_state.get_room_members(&room_id).await;
            let senders = state.client_senders.read().await;
            let broadcast_msg = Message::StateBroadcast {
                from_client: client_id,
                state: stamped,
            };
            for member_id in members.into_iter().filter(|id| *id != client_id) {
                if let Some(tx) = senders.get(&member_id) {
                    let _ = tx.send(broadcast_msg.clone());
                }
            }
        }

        Message::SendChat { content } => {
            let (room_id, chat) = state.server_state.post_chat(client_id, &content)?;
            broadcast_to_room(state, &room_id, Message::ChatBroadcast(chat)).await;
        }

        _ => {
            tracing::warn!("Unexpected message from client: {:?}", msg);
        }
    }

    Ok(())
}

async fn send_to(state: &AppState, client_id: Uuid, msg: Message) {
    if let Some(tx) = state.client_senders.read().await.get(&client_id) {
        let _ = tx.send(msg);
    }
}

async fn broadcast_to_room(state: &AppState, room_id: &str, msg: Message) {
    let members = state.server_state.get_room_members(room_id).await;
    let senders = state.client_senders.read().await;

    tracing::debug!(
        "Broadcasting to {} members in room {}",
        members.len(),
        room_id
    );

    for member_id in members {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}

/// Presence always goes out as the full snapshot of the room
async fn broadcast_presence(state: &AppState, room_id: &str, event: PresenceEvent) {
    let presences = state.server_state.presences(room_id).await;
    if presences.is_empty() {
        return;
    }
    broadcast_to_room(
        state,
        room_id,
        Message::PresenceSync {
            room_id: room_id.to_string(),
            event,
            presences,
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlaybackState;
    use crate::state::NewRoom;

    async fn connect(state: &AppState) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        state.server_state.add_client(client_id);
        state.client_senders.write().await.insert(client_id, tx);
        (client_id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn join_json(room_id: &str, user_id: &str) -> String {
        serde_json::to_string(&Message::JoinRoom {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_id.to_uppercase(),
            user_image: None,
            passcode: None,
        })
        .unwrap()
    }

    fn room(state: &AppState) -> String {
        state
            .server_state
            .create_room(NewRoom {
                room_name: "Lounge".into(),
                category: "Music".into(),
                is_public: true,
                video_url: Some("dQw4w9WgXcQ".into()),
                passcode: None,
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn state_is_relayed_to_everyone_but_the_sender() {
        let state = AppState::new(&ServerConfig::default());
        let room_id = room(&state);
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_message(&join_json(&room_id, "a"), a, &state).await.unwrap();
        handle_message(&join_json(&room_id, "b"), b, &state).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let publish = serde_json::to_string(&Message::VideoState(PlaybackState {
            video_url: "dQw4w9WgXcQ".into(),
            leader_time: 120.0,
            is_playing: true,
            server_timestamp: 0,
        }))
        .unwrap();
        handle_message(&publish, a, &state).await.unwrap();

        assert!(drain(&mut rx_a).is_empty());
        let received = drain(&mut rx_b);
        assert_eq!(received.len(), 1);
        match &received[0] {
            Message::StateBroadcast { from_client, state } => {
                assert_eq!(*from_client, a);
                assert_eq!(state.leader_time, 120.0);
                assert!(state.is_playing);
                assert!(state.server_timestamp > 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_sends_snapshot_then_presence() {
        let state = AppState::new(&ServerConfig::default());
        let room_id = room(&state);
        let (a, mut rx_a) = connect(&state).await;
        handle_message(&join_json(&room_id, "a"), a, &state).await.unwrap();

        let received = drain(&mut rx_a);
        assert_eq!(received.len(), 2);
        match &received[0] {
            Message::RoomJoined { room, state, .. } => {
                assert_eq!(room.id, room_id);
                assert_eq!(state.video_url, "dQw4w9WgXcQ");
                assert!(!state.is_playing);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(
            &received[1],
            Message::PresenceSync {
                event: PresenceEvent::Join,
                presences,
                ..
            } if presences.len() == 1
        ));
    }

    #[tokio::test]
    async fn unknown_room_and_stray_publish() {
        let state = AppState::new(&ServerConfig::default());
        let (a, mut rx_a) = connect(&state).await;
        handle_message(&join_json("123-456", "a"), a, &state).await.unwrap();
        assert!(matches!(drain(&mut rx_a).as_slice(), [Message::RoomNotFound]));

        let publish =
            serde_json::to_string(&Message::VideoState(PlaybackState::initial(None))).unwrap();
        assert!(handle_message(&publish, a, &state).await.is_err());
    }

    #[tokio::test]
    async fn leaving_notifies_remaining_members() {
        let state = AppState::new(&ServerConfig::default());
        let room_id = room(&state);
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_message(&join_json(&room_id, "a"), a, &state).await.unwrap();
        handle_message(&join_json(&room_id, "b"), b, &state).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle_message(r#"{"type":"LeaveRoom"}"#, b, &state).await.unwrap();
        assert!(matches!(drain(&mut rx_b).as_slice(), [Message::RoomLeft]));
        match drain(&mut rx_a).as_slice() {
            [Message::PresenceSync { event, presences, .. }] => {
                assert_eq!(*event, PresenceEvent::Leave);
                assert_eq!(presences.len(), 1);
                assert_eq!(presences[0].user_id, "a");
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_reaches_the_whole_room() {
        let state = AppState::new(&ServerConfig::default());
        let room_id = room(&state);
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_message(&join_json(&room_id, "a"), a, &state).await.unwrap();
        handle_message(&join_json(&room_id, "b"), b, &state).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let chat = serde_json::to_string(&Message::SendChat {
            content: "hello".into(),
        })
        .unwrap();
        handle_message(&chat, a, &state).await.unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [Message::ChatBroadcast(message)] => {
                    assert_eq!(message.content, "hello");
                    assert_eq!(message.user_id, "a");
                }
                other => panic!("unexpected messages {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn switch_into_a_full_room_stays_put() {
        let state = AppState::new(&ServerConfig {
            room_capacity: 2,
            ..ServerConfig::default()
        });
        let home = room(&state);
        let full = room(&state);
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_message(&join_json(&home, "a"), a, &state).await.unwrap();
        handle_message(&join_json(&home, "b"), b, &state).await.unwrap();
        for user in ["c", "d"] {
            let (id, _rx) = connect(&state).await;
            handle_message(&join_json(&full, user), id, &state).await.unwrap();
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        let err = handle_message(&join_json(&full, "a"), a, &state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("full"));
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());

        // still a member of the old room: its publishes keep flowing there
        let publish = serde_json::to_string(&Message::VideoState(PlaybackState {
            video_url: "dQw4w9WgXcQ".into(),
            leader_time: 30.0,
            is_playing: true,
            server_timestamp: 0,
        }))
        .unwrap();
        handle_message(&publish, a, &state).await.unwrap();
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [Message::StateBroadcast { from_client, .. }] if *from_client == a
        ));
    }
}
