use std::collections::HashMap;
use tokio::time::Instant;

/// Player states, numbered like the YouTube iframe API reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl PlayerStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(PlayerStatus::Unstarted),
            0 => Some(PlayerStatus::Ended),
            1 => Some(PlayerStatus::Playing),
            2 => Some(PlayerStatus::Paused),
            3 => Some(PlayerStatus::Buffering),
            5 => Some(PlayerStatus::Cued),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            PlayerStatus::Unstarted => -1,
            PlayerStatus::Ended => 0,
            PlayerStatus::Playing => 1,
            PlayerStatus::Paused => 2,
            PlayerStatus::Buffering => 3,
            PlayerStatus::Cued => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlayerError {
    #[error("player is not ready")]
    NotReady,
    #[error("player has been detached")]
    Detached,
    #[error("no video loaded")]
    NoVideo,
    #[error("player rejected the call: {0}")]
    Rejected(String),
}

/// Events a player reports back to the sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Ready,
    Play,
    Pause,
    Seeked,
    Ended,
}

/// Control surface of an embedded video player. Calls are synchronous and
/// expected to return quickly.
pub trait Player: Send {
    fn status(&self) -> Result<PlayerStatus, PlayerError>;
    /// Current position in seconds
    fn current_time(&self) -> Result<f64, PlayerError>;
    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError>;
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    fn load_video(&mut self, video_id: &str) -> Result<(), PlayerError>;
    fn video_id(&self) -> Option<String>;
}

/// Headless player that advances a virtual playhead with the clock
pub struct SimulatedPlayer {
    video_id: Option<String>,
    status: PlayerStatus,
    position: f64,
    playing_since: Option<Instant>,
    /// Length of the loaded video
    duration: Option<f64>,
    default_duration: Option<f64>,
    known_durations: HashMap<String, f64>,
}

impl SimulatedPlayer {
    pub fn new() -> Self {
        Self {
            video_id: None,
            status: PlayerStatus::Unstarted,
            position: 0.0,
            playing_since: None,
            duration: None,
            default_duration: None,
            known_durations: HashMap::new(),
        }
    }

    /// Give loaded videos a fixed length so playback ends
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.default_duration = Some(seconds);
        self.duration = Some(seconds);
        self
    }

    /// Length to use whenever `video_id` is loaded
    pub fn set_known_duration(&mut self, video_id: &str, seconds: f64) {
        self.known_durations.insert(video_id.to_string(), seconds);
        if self.video_id.as_deref() == Some(video_id) {
            self.duration = Some(seconds);
        }
    }

    fn playhead(&self) -> f64 {
        let elapsed = self
            .playing_since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let position = self.position + elapsed;
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn freeze(&mut self) {
        self.position = self.playhead();
        self.playing_since = None;
    }

    fn ensure_loaded(&self) -> Result<(), PlayerError> {
        if self.video_id.is_some() {
            Ok(())
        } else {
            Err(PlayerError::NoVideo)
        }
    }
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for SimulatedPlayer {
    fn status(&self) -> Result<PlayerStatus, PlayerError> {
        if self.status == PlayerStatus::Playing {
            if let Some(duration) = self.duration {
                if self.playhead() >= duration {
                    return Ok(PlayerStatus::Ended);
                }
            }
        }
        Ok(self.status)
    }

    fn current_time(&self) -> Result<f64, PlayerError> {
        self.ensure_loaded()?;
        Ok(self.playhead())
    }

    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        self.ensure_loaded()?;
        if !seconds.is_finite() {
            return Err(PlayerError::Rejected(format!("invalid position {seconds}")));
        }
        self.position = seconds.max(0.0);
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        self.ensure_loaded()?;
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
        self.status = PlayerStatus::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        self.ensure_loaded()?;
        self.freeze();
        self.status = PlayerStatus::Paused;
        Ok(())
    }

    fn load_video(&mut self, video_id: &str) -> Result<(), PlayerError> {
        if video_id.is_empty() {
            return Err(PlayerError::NoVideo);
        }
        self.video_id = Some(video_id.to_string());
        self.duration = self
            .known_durations
            .get(video_id)
            .copied()
            .or(self.default_duration);
        self.position = 0.0;
        self.playing_since = None;
        self.status = PlayerStatus::Cued;
        Ok(())
    }

    fn video_id(&self) -> Option<String> {
        self.video_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_match_youtube() {
        for status in [
            PlayerStatus::Unstarted,
            PlayerStatus::Ended,
            PlayerStatus::Playing,
            PlayerStatus::Paused,
            PlayerStatus::Buffering,
            PlayerStatus::Cued,
        ] {
            assert_eq!(PlayerStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(PlayerStatus::from_code(4), None);
    }

    #[test]
    fn calls_fail_before_a_video_is_loaded() {
        let mut player = SimulatedPlayer::new();
        assert_eq!(player.current_time(), Err(PlayerError::NoVideo));
        assert_eq!(player.play(), Err(PlayerError::NoVideo));
        assert_eq!(player.status(), Ok(PlayerStatus::Unstarted));
    }

    #[tokio::test(start_paused = true)]
    async fn playhead_follows_the_clock() {
        let mut player = SimulatedPlayer::new().with_duration(10.0);
        player.load_video("dQw4w9WgXcQ").unwrap();
        player.seek(2.0).unwrap();
        player.play().unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(player.current_time().unwrap(), 5.0);

        player.pause().unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(player.current_time().unwrap(), 5.0);
        assert_eq!(player.status().unwrap(), PlayerStatus::Paused);

        player.play().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(player.current_time().unwrap(), 10.0);
        assert_eq!(player.status().unwrap(), PlayerStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn known_durations_apply_per_video() {
        let mut player = SimulatedPlayer::new();
        player.set_known_duration("aaaaaaaaaaa", 4.0);

        player.load_video("bbbbbbbbbbb").unwrap();
        player.play().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(player.status().unwrap(), PlayerStatus::Playing);

        player.load_video("aaaaaaaaaaa").unwrap();
        player.play().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(player.current_time().unwrap(), 4.0);
        assert_eq!(player.status().unwrap(), PlayerStatus::Ended);
    }
}
