//! Test doubles shared by the session tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::player::{Player, PlayerError, PlayerEvent, PlayerStatus};
use crate::playlist::Playlist;
use crate::protocol::{CatalogVideo, PlaybackState};
use crate::session::{StateSink, SyncSession};

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCall {
    Seek(f64),
    Play,
    Pause,
    Load(String),
}

/// Player whose position only moves when told to
pub struct FakePlayer {
    pub status: PlayerStatus,
    pub time: f64,
    pub video: Option<String>,
    pub calls: Vec<PlayerCall>,
    pub fail: Option<PlayerError>,
}

impl FakePlayer {
    pub fn at(video: &str, time: f64, status: PlayerStatus) -> Self {
        Self {
            status,
            time,
            video: Some(video.to_string()),
            calls: Vec::new(),
            fail: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            status: PlayerStatus::Unstarted,
            time: 0.0,
            video: None,
            calls: Vec::new(),
            fail: None,
        }
    }

    fn check(&self) -> Result<(), PlayerError> {
        match &self.fail {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl Player for FakePlayer {
    fn status(&self) -> Result<PlayerStatus, PlayerError> {
        self.check()?;
        Ok(self.status)
    }

    fn current_time(&self) -> Result<f64, PlayerError> {
        self.check()?;
        Ok(self.time)
    }

    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        self.check()?;
        self.calls.push(PlayerCall::Seek(seconds));
        self.time = seconds;
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        self.check()?;
        self.calls.push(PlayerCall::Play);
        self.status = PlayerStatus::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        self.check()?;
        self.calls.push(PlayerCall::Pause);
        self.status = PlayerStatus::Paused;
        Ok(())
    }

    fn load_video(&mut self, video_id: &str) -> Result<(), PlayerError> {
        self.check()?;
        self.calls.push(PlayerCall::Load(video_id.to_string()));
        self.video = Some(video_id.to_string());
        self.time = 0.0;
        self.status = PlayerStatus::Cued;
        Ok(())
    }

    fn video_id(&self) -> Option<String> {
        self.video.clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    states: Mutex<Vec<PlaybackState>>,
    pub offline: AtomicBool,
}

impl RecordingSink {
    pub fn states(&self) -> Vec<PlaybackState> {
        self.states.lock().clone()
    }
}

impl StateSink for RecordingSink {
    fn publish_state(&self, state: PlaybackState) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("not connected");
        }
        self.states.lock().push(state);
        Ok(())
    }
}

pub fn playing(video: &str, leader_time: f64) -> PlaybackState {
    PlaybackState {
        video_url: video.to_string(),
        leader_time,
        is_playing: true,
        server_timestamp: 0,
    }
}

pub fn paused(video: &str, leader_time: f64) -> PlaybackState {
    PlaybackState {
        is_playing: false,
        ..playing(video, leader_time)
    }
}

/// A session past its initial sync, with the player's call log cleared
pub fn synced_session(
    player: FakePlayer,
    state: PlaybackState,
) -> (SyncSession<FakePlayer>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let mut session = SyncSession::new(player, sink.clone());
    session.handle_player_event(PlayerEvent::Ready);
    session.apply_room_snapshot(state, 0);
    session.player_mut().calls.clear();
    (session, sink)
}

/// A playlist of the given ids, in listing order
pub fn catalog(ids: &[&str]) -> Playlist {
    let videos = ids
        .iter()
        .enumerate()
        .map(|(n, id)| CatalogVideo {
            video_id: id.to_string(),
            title: format!("Video {n}"),
            category: "Music".to_string(),
            channel_title: None,
            duration: None,
            published_at: (ids.len() - n) as u64,
        })
        .collect();
    Playlist::new(videos)
}
