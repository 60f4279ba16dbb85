use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent between client and server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    // Client -> Server
    JoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
        user_image: Option<String>,
        passcode: Option<String>,
    },
    LeaveRoom,
    VideoState(PlaybackState),
    SendChat {
        content: String,
    },

    // Server -> Client
    RoomJoined {
        room: RoomRecord,
        client_id: Uuid,
        state: PlaybackState,
        server_time: u64,
        chat: Vec<ChatMessage>,
    },
    RoomLeft,
    RoomNotFound,
    PresenceSync {
        room_id: String,
        event: PresenceEvent,
        presences: Vec<Presence>,
    },
    StateBroadcast {
        from_client: Uuid,
        state: PlaybackState,
    },
    ChatBroadcast(ChatMessage),
    Error {
        message: String,
    },
}

/// The single current playback value of a room. Every publish overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub video_url: String,
    pub leader_time: f64,
    pub is_playing: bool,
    pub server_timestamp: u64,
}

impl PlaybackState {
    pub fn initial(video_url: Option<String>) -> Self {
        Self {
            video_url: video_url.unwrap_or_default(),
            leader_time: 0.0,
            is_playing: false,
            server_timestamp: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    Join,
    Leave,
    Sync,
}

/// One tracked connection in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub presence_ref: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub user_image: String,
    pub online_at: u64,
}

/// Public view of a room, as returned over HTTP and on join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    pub room_name: String,
    pub category: String,
    pub is_public: bool,
    pub passcode_enabled: bool,
    pub video_url: Option<String>,
    pub leader_time: f64,
    pub is_playing: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_image: String,
    pub content: String,
    pub created_at: u64,
}

/// One entry of a category's video list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogVideo {
    pub video_id: String,
    pub title: String,
    pub category: String,
    pub channel_title: Option<String>,
    /// Length in seconds, when known
    pub duration: Option<u64>,
    pub published_at: u64,
}

/// Room state tracked by server
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub room_name: String,
    pub category: String,
    pub is_public: bool,
    pub passcode_hash: Option<String>,
    pub video_url: Option<String>,
    pub leader_time: f64,
    pub is_playing: bool,
    pub created_at: u64,
    /// Creation order, breaks ties between rooms created in the same millisecond
    pub seq: u64,
}

impl Room {
    pub fn record(&self) -> RoomRecord {
        RoomRecord {
            id: self.id.clone(),
            room_name: self.room_name.clone(),
            category: self.category.clone(),
            is_public: self.is_public,
            passcode_enabled: self.passcode_hash.is_some(),
            video_url: self.video_url.clone(),
            leader_time: self.leader_time,
            is_playing: self.is_playing,
            created_at: self.created_at,
        }
    }
}

/// Client connection metadata
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub room_id: Option<String>,
    pub presence: Option<Presence>,
}
