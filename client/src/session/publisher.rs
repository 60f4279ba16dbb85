use tokio::time::Instant;

use super::{SyncPhase, SyncSession, TrackedState};
use crate::constants::{SEEK_SUPPRESSION, TIME_SYNC_THRESHOLD};
use crate::player::{Player, PlayerError};
use crate::protocol::PlaybackState;
use crate::utils::current_unix_millis;

impl<P: Player> SyncSession<P> {
    pub(super) fn on_local_play(&mut self) {
        // a play that matches the room is the reconciler's own doing
        if !self.can_publish() || self.room_is_playing() {
            return;
        }
        self.publish_from_player(true);
    }

    pub(super) fn on_local_pause(&mut self) {
        if !self.can_publish() || !self.room_is_playing() {
            return;
        }
        self.publish_from_player(false);
    }

    pub(super) fn on_local_seek(&mut self) {
        if !self.can_publish() {
            return;
        }
        let now = Instant::now();
        let position = match self.player.current_time() {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!("Could not read position after seek: {}", e);
                return;
            }
        };

        if let Some((target, issued_at)) = self.pending_correction.take() {
            if now.saturating_duration_since(issued_at) <= SEEK_SUPPRESSION
                && (position - target).abs() <= TIME_SYNC_THRESHOLD
            {
                tracing::debug!("Seek to {:.2}s was a correction, not publishing", position);
                return;
            }
        }

        self.seek_suppressed_until = Some(now + SEEK_SUPPRESSION);
        let is_playing = self.room_is_playing();
        self.publish(position, is_playing, now);
    }

    /// Only the active client moves the room on to the next listed video
    pub(super) fn on_local_end(&mut self) {
        if !self.can_publish() || !self.active {
            tracing::debug!("Video ended, leaving the next pick to the active client");
            return;
        }
        let current = self.current_video();
        let Some(next) = self.playlist.next_after(&current).map(|v| v.video_id.clone()) else {
            tracing::debug!("Video {} ended, nothing listed after it", current);
            return;
        };
        if let Err(e) = self.change_video(&next) {
            tracing::warn!("Could not advance to {}: {}", next, e);
        }
    }

    /// Switch the room to another video, starting it from the beginning
    pub fn change_video(&mut self, video_id: &str) -> Result<(), PlayerError> {
        if !self.can_publish() {
            tracing::debug!("Not synced yet, ignoring video change");
            return Ok(());
        }
        self.player.load_video(video_id)?;
        self.player.play()?;

        let state = PlaybackState {
            video_url: video_id.to_string(),
            leader_time: 0.0,
            is_playing: true,
            server_timestamp: current_unix_millis(),
        };
        self.publish_state(state, Instant::now());
        tracing::info!("Changed video to {}", video_id);
        Ok(())
    }

    fn publish_from_player(&mut self, is_playing: bool) {
        match self.player.current_time() {
            Ok(position) => self.publish(position, is_playing, Instant::now()),
            Err(e) => tracing::warn!("Could not read player position: {}", e),
        }
    }

    pub(super) fn publish(&mut self, leader_time: f64, is_playing: bool, now: Instant) {
        let state = PlaybackState {
            video_url: self.current_video(),
            leader_time,
            is_playing,
            server_timestamp: current_unix_millis(),
        };
        self.publish_state(state, now);
    }

    /// Apply locally first, then send. Delivery failures are only logged.
    fn publish_state(&mut self, state: PlaybackState, now: Instant) {
        self.room_state = Some(TrackedState::new(state.clone(), now));
        self.last_published = Some(state.clone());
        self.active = true;
        if let Err(e) = self.sink.publish_state(state) {
            tracing::warn!("Failed to publish playback state: {:#}", e);
        }
    }

    pub(super) fn can_publish(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    pub(super) fn room_is_playing(&self) -> bool {
        self.room_state
            .as_ref()
            .map_or(false, |tracked| tracked.state.is_playing)
    }

    fn current_video(&self) -> String {
        self.room_state
            .as_ref()
            .map(|tracked| tracked.state.video_url.clone())
            .filter(|url| !url.is_empty())
            .or_else(|| self.player.video_id())
            .unwrap_or_default()
    }
}
