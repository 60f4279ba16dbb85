use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::constants::KEEPALIVE_INTERVAL;
use crate::profile::Profile;
use crate::protocol::{Message, PlaybackState};
use crate::session::StateSink;
use crate::utils::current_unix_millis;

/// WebSocket transport to the relay. Cheap to clone; clones share one socket.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    connected: watch::Sender<bool>,
    room_id: Mutex<Option<String>>,
    client_id: Mutex<Option<Uuid>>,
    stats: Mutex<SyncStats>,
}

#[derive(Default, Clone)]
struct SyncStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    last_disconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

#[derive(Debug)]
pub struct SyncStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
    pub endpoint_label: Option<String>,
    pub last_disconnect_secs: Option<f32>,
}

impl SyncClient {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(SyncClientState {
                tx: Mutex::new(None),
                connected,
                room_id: Mutex::new(None),
                client_id: Mutex::new(None),
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Connect to the sync server. Returns a receiver that resolves when the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<Message>(&text) {
                            Ok(parsed) => handler(parsed),
                            Err(e) => tracing::warn!("Ignoring unparseable server message: {}", e),
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if ping_inner.send_keepalive().is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn mark_connected(&self, label: &str) {
        self.inner.mark_connected(label);
    }

    pub fn mark_disconnected(&self) {
        self.inner.mark_disconnected();
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Follows the transport's connected flag, for timers that only run while online
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn stats_snapshot(&self) -> SyncStatsSnapshot {
        self.inner.snapshot()
    }

    /// Join a room as the given user
    pub fn join_room(
        &self,
        room_id: &str,
        profile: &Profile,
        passcode: Option<String>,
    ) -> Result<()> {
        self.send_message(Message::JoinRoom {
            room_id: room_id.to_string(),
            user_id: profile.user_id.clone(),
            user_name: profile.display_name.clone(),
            user_image: profile.image.clone(),
            passcode,
        })
    }

    /// Leave current room
    pub fn leave_room(&self) -> Result<()> {
        self.send_message(Message::LeaveRoom)
    }

    pub fn send_chat(&self, content: &str) -> Result<()> {
        self.send_message(Message::SendChat {
            content: content.to_string(),
        })
    }

    /// Update room state after receiving server response
    pub fn set_room_joined(&self, room_id: String, client_id: Uuid) {
        *self.inner.room_id.lock() = Some(room_id);
        *self.inner.client_id.lock() = Some(client_id);
    }

    /// Clear room state
    pub fn clear_room(&self) {
        *self.inner.room_id.lock() = None;
        *self.inner.client_id.lock() = None;
    }

    pub fn current_room(&self) -> Option<String> {
        self.inner.room_id.lock().clone()
    }

    pub fn client_id(&self) -> Option<Uuid> {
        *self.inner.client_id.lock()
    }

    fn send_message(&self, msg: Message) -> Result<()> {
        let json = serde_json::to_string(&msg).context("Failed to serialize message")?;
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .context("Not connected to sync server")?;
        self.inner.record_outgoing(json.len() as u64);
        tx.send(WsMessage::Text(json.into()))
            .context("Failed to queue message to socket")?;
        Ok(())
    }
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSink for SyncClient {
    fn publish_state(&self, state: PlaybackState) -> Result<()> {
        self.send_message(Message::VideoState(state))
    }
}

impl SyncClientState {
    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);
        self.record_pong(nonce);
    }

    fn record_pong(&self, nonce: u64) {
        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        self.record_outgoing(payload.len() as u64);
        self.enqueue_ws(WsMessage::Ping(payload.into()))
    }

    fn clear_transport(&self) {
        *self.tx.lock() = None;
        self.connected.send_replace(false);
        let mut stats = self.stats.lock();
        stats.last_ping_nonce = None;
        stats.last_ping_sent = None;
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(message).map_err(|_| ())
        } else {
            Err(())
        }
    }

    fn mark_connected(&self, label: &str) {
        {
            let mut stats = self.stats.lock();
            stats.connected_since = Some(Instant::now());
            stats.endpoint_label = Some(label.to_string());
        }
        self.connected.send_replace(true);
    }

    fn mark_disconnected(&self) {
        self.connected.send_replace(false);
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
        stats.last_disconnect_at = Some(Instant::now());
    }

    fn snapshot(&self) -> SyncStatsSnapshot {
        let stats = self.stats.lock();
        let last_message_age = stats
            .last_message_at
            .map(|inst| inst.elapsed().as_secs_f32());
        let connected_duration = stats
            .connected_since
            .map(|inst| inst.elapsed().as_secs_f32());
        let last_disconnect_secs = stats
            .last_disconnect_at
            .map(|inst| inst.elapsed().as_secs_f32());
        SyncStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age,
            connected_duration,
            reconnect_attempts: stats.reconnect_attempts,
            endpoint_label: stats.endpoint_label.clone(),
            last_disconnect_secs,
        }
    }
}
