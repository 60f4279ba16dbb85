use anyhow::Context;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::RoomError;
use crate::protocol::{
    CatalogVideo, ChatMessage, ClientInfo, PlaybackState, Presence, Room, RoomRecord,
};

const LOG_TAG: &str = "[Watchparty Server]";
const MAX_NAME_LENGTH: usize = 32;
const MAX_CHAT_LENGTH: usize = 1000;
const DEFAULT_USER_IMAGE: &str = "https://github.com/shadcn.png";
const MAX_TITLE_LENGTH: usize = 200;

/// Body of `POST /rooms`
#[derive(Debug, Clone, Deserialize)]
pub struct NewRoom {
    pub room_name: String,
    pub category: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub passcode: Option<String>,
}

fn default_public() -> bool {
    true
}

/// Body of `POST /categories/:slug/videos`
#[derive(Debug, Clone, Deserialize)]
pub struct NewVideo {
    pub video_id: String,
    pub title: String,
    #[serde(default)]
    pub channel_title: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    /// Defaults to the time the video is added
    #[serde(default)]
    pub published_at: Option<u64>,
}

/// One entry of the catalog file read at start-up
#[derive(Debug, Deserialize)]
struct CatalogSeed {
    category: String,
    #[serde(flatten)]
    video: NewVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Prev,
}

/// Who a connection claims to be when it joins a room
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
    pub user_image: Option<String>,
}

pub struct JoinOutcome {
    pub room: RoomRecord,
    pub state: PlaybackState,
    pub chat: Vec<ChatMessage>,
    /// Room the client was in before this join, if it switched rooms
    pub previous_room: Option<String>,
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    /// All rooms: room_id -> Room
    pub rooms: Arc<DashMap<String, Room>>,
    /// Current playback per room: room_id -> PlaybackState
    pub playback: Arc<DashMap<String, PlaybackState>>,
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    /// Room membership: room_id -> Vec<client_id>
    pub room_members: Arc<DashMap<String, Arc<RwLock<Vec<Uuid>>>>>,
    /// Recent chat per room, oldest first
    chat: Arc<DashMap<String, VecDeque<ChatMessage>>>,
    /// Room opened for each category: lowercased category -> room_id
    category_rooms: Arc<DashMap<String, String>>,
    /// Videos per category: lowercased category -> videos
    catalog: Arc<DashMap<String, Vec<CatalogVideo>>>,
    next_seq: Arc<AtomicU64>,
    capacity: usize,
    chat_history: usize,
}

impl ServerState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            playback: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            room_members: Arc::new(DashMap::new()),
            chat: Arc::new(DashMap::new()),
            category_rooms: Arc::new(DashMap::new()),
            catalog: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            capacity: config.room_capacity,
            chat_history: config.chat_history,
        }
    }

    pub fn create_room(&self, new_room: NewRoom) -> Result<RoomRecord, RoomError> {
        let room_name = new_room.room_name.trim();
        if room_name.is_empty() {
            return Err(RoomError::EmptyField("room_name"));
        }
        let category = new_room.category.trim();
        if category.is_empty() {
            return Err(RoomError::EmptyField("category"));
        }

        let room_id = self.generate_room_code();
        let passcode_hash = new_room
            .passcode
            .filter(|code| !code.is_empty())
            .map(|code| Self::hash_passcode(&code, &room_id));
        let video_url = new_room
            .video_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let room = Room {
            id: room_id.clone(),
            room_name: room_name.to_string(),
            category: category.to_string(),
            is_public: new_room.is_public,
            passcode_hash,
            video_url: video_url.clone(),
            leader_time: 0.0,
            is_playing: false,
            created_at: current_unix_millis(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let record = room.record();

        self.playback
            .insert(room_id.clone(), PlaybackState::initial(video_url));
        self.room_members
            .insert(room_id.clone(), Arc::new(RwLock::new(Vec::new())));
        self.rooms.insert(room_id.clone(), room);

        tracing::info!(
            "{LOG_TAG} Room {} ({}) created in category {}",
            room_id,
            record.room_name,
            record.category
        );
        Ok(record)
    }

    pub fn room(&self, room_id: &str) -> Option<RoomRecord> {
        self.rooms.get(room_id).map(|room| room.record())
    }

    /// Public rooms in creation order, optionally restricted to one category
    pub fn public_rooms(&self, category: Option<&str>) -> Vec<RoomRecord> {
        let mut rooms: Vec<(u64, u64, RoomRecord)> = self
            .rooms
            .iter()
            .filter(|entry| entry.is_public)
            .filter(|entry| category.map_or(true, |c| entry.category.eq_ignore_ascii_case(c)))
            .map(|entry| (entry.created_at, entry.seq, entry.record()))
            .collect();
        rooms.sort_by_key(|(created_at, seq, _)| (*created_at, *seq));
        rooms.into_iter().map(|(_, _, record)| record).collect()
    }

    /// Step to the next or previous public room sharing this room's category
    pub fn neighbor(&self, room_id: &str, direction: Direction) -> Result<RoomRecord, RoomError> {
        let category = self
            .rooms
            .get(room_id)
            .map(|room| room.category.clone())
            .ok_or(RoomError::NotFound)?;
        let mut rooms = self.public_rooms(Some(&category));
        if rooms.is_empty() {
            return Err(RoomError::NotFound);
        }

        let len = rooms.len();
        let index = match rooms.iter().position(|room| room.id == room_id) {
            Some(current) => match direction {
                Direction::Next => (current + 1) % len,
                Direction::Prev => (current + len - 1) % len,
            },
            None => match direction {
                Direction::Next => 0,
                Direction::Prev => len - 1,
            },
        };
        Ok(rooms.swap_remove(index))
    }

    /// Find the public room of a category, creating it on first use
    pub fn category_room(&self, slug: &str) -> Result<RoomRecord, RoomError> {
        let name = category_name_from_slug(slug);
        if name.is_empty() {
            return Err(RoomError::EmptyField("category"));
        }

        // the entry stays locked while the room is looked up or created
        let room_id = self
            .category_rooms
            .entry(name.to_lowercase())
            .or_try_insert_with(|| match self.public_rooms(Some(&name)).into_iter().next() {
                Some(existing) => Ok(existing.id),
                None => self
                    .create_room(NewRoom {
                        room_name: format!("{name} Room"),
                        category: name.clone(),
                        is_public: true,
                        video_url: None,
                        passcode: None,
                    })
                    .map(|record| record.id),
            })?
            .value()
            .clone();
        self.room(&room_id).ok_or(RoomError::NotFound)
    }

    /// Add a video to a category's list; an entry with the same id is replaced
    pub fn add_video(&self, slug: &str, video: NewVideo) -> Result<CatalogVideo, RoomError> {
        let category = category_name_from_slug(slug);
        if category.is_empty() {
            return Err(RoomError::EmptyField("category"));
        }
        let video_id = video.video_id.trim();
        if !is_video_id(video_id) {
            return Err(RoomError::InvalidVideoId(video_id.to_string()));
        }
        let title: String = video
            .title
            .trim()
            .chars()
            .filter(|ch| !ch.is_control())
            .take(MAX_TITLE_LENGTH)
            .collect();
        if title.is_empty() {
            return Err(RoomError::EmptyField("title"));
        }

        let entry = CatalogVideo {
            video_id: video_id.to_string(),
            title,
            category: category.clone(),
            channel_title: video
                .channel_title
                .map(|channel| channel.trim().to_string())
                .filter(|channel| !channel.is_empty()),
            duration: video.duration.filter(|secs| *secs > 0),
            published_at: video.published_at.unwrap_or_else(current_unix_millis),
        };

        let mut videos = self.catalog.entry(category.to_lowercase()).or_default();
        videos.retain(|existing| existing.video_id != entry.video_id);
        videos.push(entry.clone());

        tracing::info!(
            "{LOG_TAG} Video {} added to category {}",
            entry.video_id,
            category
        );
        Ok(entry)
    }

    /// A category's videos, newest first
    pub fn category_videos(&self, slug: &str) -> Vec<CatalogVideo> {
        let key = category_name_from_slug(slug).to_lowercase();
        let mut videos = self
            .catalog
            .get(&key)
            .map(|videos| videos.clone())
            .unwrap_or_default();
        videos.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        videos
    }

    /// Seed the catalog from a JSON array of `{category, video_id, title, ...}`.
    /// Invalid entries are skipped; returns how many were added.
    pub fn load_catalog(&self, path: &Path) -> anyhow::Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let seeds: Vec<CatalogSeed> =
            serde_json::from_str(&raw).context("Failed to parse catalog")?;

        let mut added = 0;
        for seed in seeds {
            match self.add_video(&seed.category, seed.video) {
                Ok(_) => added += 1,
                Err(e) => tracing::warn!("{LOG_TAG} Skipping catalog entry: {}", e),
            }
        }
        Ok(added)
    }

    pub async fn join_room(
        &self,
        client_id: Uuid,
        room_id: &str,
        user: UserIdentity,
        passcode: Option<String>,
    ) -> Result<JoinOutcome, RoomError> {
        let record = {
            let room = self.rooms.get(room_id).ok_or(RoomError::NotFound)?;
            if let Some(expected) = &room.passcode_hash {
                let provided = passcode
                    .as_ref()
                    .filter(|code| !code.is_empty())
                    .ok_or(RoomError::PasscodeRequired)?;
                if &Self::hash_passcode(provided, room_id) != expected {
                    return Err(RoomError::InvalidPasscode);
                }
            }
            room.record()
        };

        let members = self
            .room_members
            .get(room_id)
            .map(|members| Arc::clone(&*members))
            .ok_or(RoomError::NotFound)?;
        {
            let mut members = members.write().await;
            let already_member = members.contains(&client_id);
            if !already_member && members.len() >= self.capacity {
                return Err(RoomError::Full {
                    capacity: self.capacity,
                });
            }
            if !already_member {
                members.push(client_id);
            }
        }

        // leave the old room only once the new seat is held
        let current_room = self.clients.get(&client_id).and_then(|c| c.room_id.clone());
        let previous_room = match current_room {
            Some(current) if current != room_id => self.leave_room(client_id).await,
            _ => None,
        };

        let presence = Self::presence_for(client_id, user);
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = Some(room_id.to_string());
            client.presence = Some(presence);
        } else {
            self.clients.insert(
                client_id,
                ClientInfo {
                    room_id: Some(room_id.to_string()),
                    presence: Some(presence),
                },
            );
        }

        tracing::info!("{LOG_TAG} Client {} joined room {}", client_id, room_id);
        Ok(JoinOutcome {
            room: record,
            state: self.current_state(room_id),
            chat: self.chat_history(room_id),
            previous_room,
        })
    }

    /// Rooms outlive their members; leaving only drops membership and presence.
    pub async fn leave_room(&self, client_id: Uuid) -> Option<String> {
        let room_id = self.clients.get(&client_id).and_then(|c| c.room_id.clone())?;

        let members = self
            .room_members
            .get(&room_id)
            .map(|members| Arc::clone(&*members));
        if let Some(members) = members {
            members.write().await.retain(|id| *id != client_id);
        }

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = None;
            client.presence = None;
        }

        tracing::info!("{LOG_TAG} Client {} left room {}", client_id, room_id);
        Some(room_id)
    }

    pub async fn get_room_members(&self, room_id: &str) -> Vec<Uuid> {
        if let Some(members_ref) = self.room_members.get(room_id) {
            let members_lock = Arc::clone(&*members_ref);
            drop(members_ref);
            let members = members_lock.read().await;
            members.clone()
        } else {
            Vec::new()
        }
    }

    /// Full presence snapshot of a room, one entry per connection
    pub async fn presences(&self, room_id: &str) -> Vec<Presence> {
        self.get_room_members(room_id)
            .await
            .into_iter()
            .filter_map(|member_id| {
                self.clients
                    .get(&member_id)
                    .and_then(|info| info.presence.clone())
            })
            .collect()
    }

    /// Accept a publish from a room member: stamp it, overwrite the room's
    /// current state and mirror it into the room record.
    pub fn publish_state(
        &self,
        client_id: Uuid,
        state: PlaybackState,
    ) -> Result<(String, PlaybackState), RoomError> {
        let room_id = self
            .clients
            .get(&client_id)
            .and_then(|c| c.room_id.clone())
            .ok_or(RoomError::NotInRoom)?;

        let leader_time = if state.leader_time.is_finite() {
            state.leader_time.max(0.0)
        } else {
            0.0
        };
        let stamped = PlaybackState {
            video_url: state.video_url.trim().to_string(),
            leader_time,
            is_playing: state.is_playing,
            server_timestamp: current_unix_millis(),
        };

        {
            let mut room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
            room.video_url = Some(stamped.video_url.clone()).filter(|url| !url.is_empty());
            room.leader_time = stamped.leader_time;
            room.is_playing = stamped.is_playing;
        }
        self.playback.insert(room_id.clone(), stamped.clone());

        tracing::debug!(
            "{LOG_TAG} Room {} state from {}: {:.2}s playing={} video={}",
            room_id,
            client_id,
            stamped.leader_time,
            stamped.is_playing,
            stamped.video_url
        );
        Ok((room_id, stamped))
    }

    pub fn current_state(&self, room_id: &str) -> PlaybackState {
        if let Some(state) = self.playback.get(room_id) {
            return state.clone();
        }
        let video_url = self.rooms.get(room_id).and_then(|room| room.video_url.clone());
        PlaybackState::initial(video_url)
    }

    pub fn post_chat(
        &self,
        client_id: Uuid,
        content: &str,
    ) -> Result<(String, ChatMessage), RoomError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RoomError::EmptyField("content"));
        }
        if content.chars().count() > MAX_CHAT_LENGTH {
            return Err(RoomError::ChatTooLong(MAX_CHAT_LENGTH));
        }

        let (room_id, presence) = self
            .clients
            .get(&client_id)
            .and_then(|c| Some((c.room_id.clone()?, c.presence.clone()?)))
            .ok_or(RoomError::NotInRoom)?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id: room_id.clone(),
            user_id: presence.user_id,
            user_name: presence.user_name,
            user_image: presence.user_image,
            content: content.to_string(),
            created_at: current_unix_millis(),
        };

        let mut history = self.chat.entry(room_id.clone()).or_default();
        history.push_back(message.clone());
        while history.len() > self.chat_history {
            history.pop_front();
        }

        Ok((room_id, message))
    }

    pub fn chat_history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.chat
            .get(room_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_client(&self, client_id: Uuid) {
        self.clients.insert(
            client_id,
            ClientInfo {
                room_id: None,
                presence: None,
            },
        );
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    /// Drop a connection; returns the room it was in so presence can be re-sent
    pub async fn remove_client(&self, client_id: Uuid) -> Option<String> {
        let left = self.leave_room(client_id).await;
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
        left
    }

    fn presence_for(client_id: Uuid, user: UserIdentity) -> Presence {
        let user_id = Some(user.user_id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| client_id.to_string());
        let user_name = Self::sanitize_display_name(&user.user_name)
            .unwrap_or_else(|| Self::default_display_name(client_id));
        let user_image = user
            .user_image
            .map(|image| image.trim().to_string())
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_IMAGE.to_string());

        Presence {
            presence_ref: client_id,
            user_id,
            user_name,
            user_image,
            online_at: current_unix_millis(),
        }
    }

    fn generate_room_code(&self) -> String {
        loop {
            let raw = (Uuid::new_v4().as_u128() % 1_000_000) as u32;
            let code = format!("{:03}-{:03}", raw / 1000, raw % 1000);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        }
    }

    fn hash_passcode(passcode: &str, room_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(room_id.as_bytes());
        hasher.update(passcode.as_bytes());
        let digest = hasher.finalize();
        format!("{:x}", digest)
    }

    fn sanitize_display_name(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let cleaned: String = trimmed
            .chars()
            .filter(|ch| !ch.is_control())
            .take(MAX_NAME_LENGTH)
            .collect();
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }

    fn default_display_name(client_id: Uuid) -> String {
        let short = &client_id.to_string()[..8];
        format!("Guest {short}")
    }
}

/// YouTube ids are 11 characters of `[A-Za-z0-9_-]`
fn is_video_id(candidate: &str) -> bool {
    candidate.len() == 11
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// `"live-music"` -> `"Live Music"`
pub fn category_name_from_slug(slug: &str) -> String {
    slug.split(['-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
