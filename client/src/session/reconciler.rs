use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{SharedSession, TrackedState};
use crate::constants::{RECONCILE_INTERVAL, TIME_SYNC_THRESHOLD};
use crate::player::{Player, PlayerError, PlayerStatus};

/// When a drifted player may be repositioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPolicy {
    /// Only while the room is playing
    WhenPlaying,
    /// Regardless of play state, used for the first pass after joining
    Always,
    /// Never, while a local seek is still settling
    Never,
}

/// What a reconciliation pass did to the player
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Corrections {
    pub loaded: Option<String>,
    pub seeked_to: Option<f64>,
    pub played: bool,
    pub paused: bool,
}

impl Corrections {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_none() && self.seeked_to.is_none() && !self.played && !self.paused
    }
}

/// Steer `player` towards `target` as of `now`.
///
/// Loads the room's video if the player shows something else, leaves a
/// buffering player alone, seeks when the drift exceeds
/// [`TIME_SYNC_THRESHOLD`] and the policy allows, then matches play/pause.
pub fn reconcile<P: Player + ?Sized>(
    player: &mut P,
    target: &TrackedState,
    now: Instant,
    policy: SeekPolicy,
) -> Result<Corrections, PlayerError> {
    let mut corrections = Corrections::default();
    let state = &target.state;

    if !state.video_url.is_empty()
        && player.video_id().as_deref() != Some(state.video_url.as_str())
    {
        player.load_video(&state.video_url)?;
        corrections.loaded = Some(state.video_url.clone());
    }
    if player.video_id().is_none() {
        return Ok(corrections);
    }

    let status = player.status()?;
    if status == PlayerStatus::Buffering {
        return Ok(corrections);
    }

    let expected = target.expected_position(now);
    let drift = (player.current_time()? - expected).abs();
    let may_seek = match policy {
        SeekPolicy::WhenPlaying => state.is_playing,
        SeekPolicy::Always => true,
        SeekPolicy::Never => false,
    };
    if may_seek && drift > TIME_SYNC_THRESHOLD {
        player.seek(expected)?;
        corrections.seeked_to = Some(expected);
    }

    if state.is_playing && status != PlayerStatus::Playing {
        player.play()?;
        corrections.played = true;
    } else if !state.is_playing && status == PlayerStatus::Playing {
        player.pause()?;
        corrections.paused = true;
    }

    Ok(corrections)
}

/// Re-evaluate the session once per [`RECONCILE_INTERVAL`]
pub async fn run_reconcile_ticks<P: Player>(session: SharedSession<P>) {
    let mut ticker = interval_at(Instant::now() + RECONCILE_INTERVAL, RECONCILE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        session.lock().reconcile_tick();
    }
}
