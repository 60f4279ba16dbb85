use std::collections::VecDeque;
use uuid::Uuid;

use crate::constants::CHAT_LOG_LIMIT;
use crate::player::Player;
use crate::presence::{RoomUser, Roster};
use crate::protocol::{ChatMessage, Message, RoomRecord};
use crate::session::SharedSession;

/// What a server message changed, for whoever renders the room
#[derive(Debug, Clone, PartialEq)]
pub enum RoomNotice {
    Joined(RoomRecord),
    Left,
    UsersChanged(usize),
    Chat(ChatMessage),
    Error(String),
    RoomGone,
}

/// View state of one room: who is here, what was said, and the sync session
pub struct RoomController<P: Player> {
    session: SharedSession<P>,
    room: Option<RoomRecord>,
    client_id: Option<Uuid>,
    roster: Roster,
    chat: VecDeque<ChatMessage>,
    error: Option<String>,
    halted: bool,
}

impl<P: Player> RoomController<P> {
    pub fn new(session: SharedSession<P>) -> Self {
        Self {
            session,
            room: None,
            client_id: None,
            roster: Roster::new(),
            chat: VecDeque::with_capacity(CHAT_LOG_LIMIT),
            error: None,
            halted: false,
        }
    }

    pub fn handle_server_message(&mut self, msg: Message) -> Option<RoomNotice> {
        match msg {
            Message::RoomJoined {
                room,
                client_id,
                state,
                server_time,
                chat,
            } => {
                tracing::info!("Joined room {} ({})", room.room_name, room.id);
                self.client_id = Some(client_id);
                self.error = None;
                self.halted = false;
                self.chat = chat.into_iter().collect();
                self.trim_chat();
                self.session.lock().apply_room_snapshot(state, server_time);
                self.room = Some(room.clone());
                Some(RoomNotice::Joined(room))
            }
            Message::RoomLeft => {
                self.room = None;
                self.client_id = None;
                self.roster.clear();
                Some(RoomNotice::Left)
            }
            Message::RoomNotFound => {
                self.fail("Room not found");
                Some(RoomNotice::RoomGone)
            }
            Message::PresenceSync {
                room_id,
                event,
                presences,
            } => {
                if !self.is_current_room(&room_id) {
                    return None;
                }
                self.roster.apply(event, &presences);
                Some(RoomNotice::UsersChanged(self.roster.users().len()))
            }
            Message::StateBroadcast { from_client, state } => {
                if self.halted {
                    return None;
                }
                tracing::debug!(
                    "State from {}: {:.2}s playing={}",
                    from_client,
                    state.leader_time,
                    state.is_playing
                );
                if let Some(room) = self.room.as_mut() {
                    room.video_url = Some(state.video_url.clone()).filter(|url| !url.is_empty());
                    room.leader_time = state.leader_time;
                    room.is_playing = state.is_playing;
                }
                self.session.lock().apply_remote_state(state);
                None
            }
            Message::ChatBroadcast(message) => {
                if !self.is_current_room(&message.room_id) {
                    return None;
                }
                self.chat.push_back(message.clone());
                self.trim_chat();
                Some(RoomNotice::Chat(message))
            }
            Message::Error { message } => {
                tracing::warn!("Server error: {}", message);
                self.error = Some(message.clone());
                Some(RoomNotice::Error(message))
            }
            Message::JoinRoom { .. }
            | Message::LeaveRoom
            | Message::VideoState(_)
            | Message::SendChat { .. } => {
                tracing::debug!("Ignoring client-bound message from server");
                None
            }
        }
    }

    /// Record a failed room lookup; the view stops syncing until the next join
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Room unavailable: {}", message);
        self.error = Some(message);
        self.halted = true;
    }

    pub fn session(&self) -> &SharedSession<P> {
        &self.session
    }

    pub fn room(&self) -> Option<&RoomRecord> {
        self.room.as_ref()
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    pub fn users(&self) -> &[RoomUser] {
        self.roster.users()
    }

    pub fn chat(&self) -> impl Iterator<Item = &ChatMessage> {
        self.chat.iter()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn is_current_room(&self, room_id: &str) -> bool {
        self.room.as_ref().map_or(false, |room| room.id == room_id)
    }

    fn trim_chat(&mut self) {
        while self.chat.len() > CHAT_LOG_LIMIT {
            self.chat.pop_front();
        }
    }
}
