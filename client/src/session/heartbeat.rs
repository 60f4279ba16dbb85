use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{SharedSession, SyncPhase, SyncSession};
use crate::constants::SYNC_INTERVAL;
use crate::player::{Player, PlayerStatus};

impl<P: Player> SyncSession<P> {
    /// Re-publish the local player's state if this client is the active one.
    /// Returns whether a state went out.
    pub fn heartbeat(&mut self) -> bool {
        if self.phase != SyncPhase::Synced || !self.active {
            return false;
        }

        let snapshot = self
            .player
            .status()
            .and_then(|status| Ok((status, self.player.current_time()?)));
        match snapshot {
            Ok((status, position)) => {
                let is_playing = match status {
                    PlayerStatus::Playing => true,
                    // a stall is not a pause
                    PlayerStatus::Buffering => self.room_is_playing(),
                    _ => false,
                };
                self.publish(position, is_playing, Instant::now());
                true
            }
            Err(e) => {
                tracing::warn!("Skipping heartbeat: {}", e);
                false
            }
        }
    }
}

/// Drive [`SyncSession::heartbeat`] every [`SYNC_INTERVAL`] while the
/// transport is connected. The interval restarts on reconnect.
pub async fn run_heartbeat<P: Player>(
    session: SharedSession<P>,
    mut connected: watch::Receiver<bool>,
) {
    loop {
        while !*connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                return;
            }
        }

        let mut ticker = interval_at(Instant::now() + SYNC_INTERVAL, SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    session.lock().heartbeat();
                }
                changed = connected.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*connected.borrow_and_update() {
                        tracing::debug!("Heartbeat paused while disconnected");
                        break;
                    }
                }
            }
        }
    }
}
