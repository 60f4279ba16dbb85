//! Leader-relative playback synchronization
//!
//! One [`SyncSession`] per joined room. It owns the local player, remembers
//! the latest [`PlaybackState`] it knows of, and splits its work three ways:
//! the publisher turns local intent into state, the reconciler steers the
//! player towards received state, and the heartbeat re-asserts state on the
//! active client so lost messages heal.

mod heartbeat;
mod publisher;
mod reconciler;

pub use heartbeat::run_heartbeat;
pub use reconciler::{reconcile, run_reconcile_ticks, Corrections, SeekPolicy};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::player::{Player, PlayerEvent};
use crate::playlist::Playlist;
use crate::protocol::PlaybackState;

/// Where published states go. Sends are fire-and-forget.
pub trait StateSink: Send + Sync {
    fn publish_state(&self, state: PlaybackState) -> anyhow::Result<()>;
}

/// Per-client lifecycle. A join snapshot sends a synced session back to
/// `Ready` until the player has taken it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Ready,
    Synced,
}

/// A state together with the local instant it became known
#[derive(Debug, Clone)]
pub struct TrackedState {
    pub state: PlaybackState,
    pub observed_at: Instant,
}

impl TrackedState {
    pub fn new(state: PlaybackState, observed_at: Instant) -> Self {
        Self { state, observed_at }
    }

    /// Where the leader should be by `now`. Exactly `leader_time` at the
    /// moment of observation; advances with the clock while playing.
    pub fn expected_position(&self, now: Instant) -> f64 {
        if self.state.is_playing {
            self.state.leader_time + now.saturating_duration_since(self.observed_at).as_secs_f64()
        } else {
            self.state.leader_time
        }
    }
}

pub type SharedSession<P> = Arc<Mutex<SyncSession<P>>>;

pub struct SyncSession<P: Player> {
    player: P,
    sink: Arc<dyn StateSink>,
    phase: SyncPhase,
    room_state: Option<TrackedState>,
    seek_suppressed_until: Option<Instant>,
    /// Last corrective seek, so the player's seek event for it is not re-published
    pending_correction: Option<(f64, Instant)>,
    active: bool,
    /// What this client last sent, to recognise its own state in a rejoin snapshot
    last_published: Option<PlaybackState>,
    /// Where the active client goes when a video ends
    playlist: Playlist,
}

impl<P: Player> SyncSession<P> {
    pub fn new(player: P, sink: Arc<dyn StateSink>) -> Self {
        Self {
            player,
            sink,
            phase: SyncPhase::Uninitialized,
            room_state: None,
            seek_suppressed_until: None,
            pending_correction: None,
            active: false,
            last_published: None,
            playlist: Playlist::default(),
        }
    }

    pub fn shared(self) -> SharedSession<P> {
        Arc::new(Mutex::new(self))
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Whether this client's own publish is the latest state it knows of
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn room_state(&self) -> Option<&PlaybackState> {
        self.room_state.as_ref().map(|tracked| &tracked.state)
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn set_playlist(&mut self, playlist: Playlist) {
        self.playlist = playlist;
    }

    pub fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => self.on_player_ready(),
            PlayerEvent::Play => self.on_local_play(),
            PlayerEvent::Pause => self.on_local_pause(),
            PlayerEvent::Seeked => self.on_local_seek(),
            PlayerEvent::Ended => self.on_local_end(),
        }
    }

    fn on_player_ready(&mut self) {
        if self.phase == SyncPhase::Uninitialized {
            self.phase = SyncPhase::Ready;
            tracing::debug!("Player ready");
        }
        self.try_initial_sync(Instant::now());
    }

    /// Adopt the room state delivered on join. `server_time` is the server's
    /// clock when it sent the snapshot and ages the state.
    ///
    /// Every snapshot starts a fresh initial sync, so a client that switches
    /// rooms or rejoins after a reconnect lands on the room's position even
    /// when it is paused. The active flag survives only if the room still
    /// holds the state this client last published.
    pub fn apply_room_snapshot(&mut self, state: PlaybackState, server_time: u64) {
        let now = Instant::now();
        let age = if state.server_timestamp > 0 {
            Duration::from_millis(server_time.saturating_sub(state.server_timestamp))
        } else {
            Duration::ZERO
        };
        let observed_at = now.checked_sub(age).unwrap_or(now);

        let own_state = self
            .last_published
            .as_ref()
            .map_or(false, |sent| same_playback(sent, &state));
        if self.active && !own_state {
            tracing::debug!("Room state changed while away, no longer the active client");
        }
        self.active = self.active && own_state;
        self.seek_suppressed_until = None;
        self.pending_correction = None;
        self.room_state = Some(TrackedState::new(state, observed_at));

        if self.phase == SyncPhase::Synced {
            self.phase = SyncPhase::Ready;
        }
        self.try_initial_sync(now);
    }

    /// A state published by another client
    pub fn apply_remote_state(&mut self, state: PlaybackState) {
        let now = Instant::now();
        if self.seek_suppressed(now) {
            tracing::debug!(
                "Ignoring remote state at {:.2}s during local seek",
                state.leader_time
            );
            return;
        }

        self.active = false;
        self.room_state = Some(TrackedState::new(state, now));
        if self.phase == SyncPhase::Synced {
            self.reconcile_at(now, SeekPolicy::WhenPlaying);
        } else {
            self.try_initial_sync(now);
        }
    }

    /// Periodic re-evaluation without a new state. Also retries an initial
    /// sync the player was not able to take yet.
    pub fn reconcile_tick(&mut self) {
        match self.phase {
            SyncPhase::Synced => {
                self.reconcile_at(Instant::now(), SeekPolicy::WhenPlaying);
            }
            SyncPhase::Ready => self.try_initial_sync(Instant::now()),
            SyncPhase::Uninitialized => {}
        }
    }

    fn try_initial_sync(&mut self, now: Instant) {
        if self.phase != SyncPhase::Ready || self.room_state.is_none() {
            return;
        }
        if self.reconcile_at(now, SeekPolicy::Always) {
            self.phase = SyncPhase::Synced;
            tracing::info!("Initial sync complete");
        }
    }

    /// Returns false when the player could not be read or driven.
    fn reconcile_at(&mut self, now: Instant, policy: SeekPolicy) -> bool {
        let Some(target) = self.room_state.clone() else {
            return false;
        };
        let policy = if self.seek_suppressed(now) {
            SeekPolicy::Never
        } else {
            policy
        };

        match reconcile(&mut self.player, &target, now, policy) {
            Ok(corrections) => {
                if let Some(position) = corrections.seeked_to {
                    self.pending_correction = Some((position, now));
                }
                if !corrections.is_empty() {
                    tracing::debug!("Corrected local player: {:?}", corrections);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Skipping reconciliation: {}", e);
                false
            }
        }
    }

    fn seek_suppressed(&self, now: Instant) -> bool {
        self.seek_suppressed_until.map_or(false, |until| now < until)
    }
}

/// Same video, position and play state; the server's stamp is ignored
fn same_playback(a: &PlaybackState, b: &PlaybackState) -> bool {
    a.video_url == b.video_url && a.leader_time == b.leader_time && a.is_playing == b.is_playing
}

/// Background timers of a session. Dropping the handle tears them down.
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub fn spawn_sync_tasks<P: Player + 'static>(
    session: &SharedSession<P>,
    connected: watch::Receiver<bool>,
) -> SyncHandle {
    let heartbeat = tokio::spawn(run_heartbeat(Arc::clone(session), connected));
    let reconcile = tokio::spawn(run_reconcile_ticks(Arc::clone(session)));
    SyncHandle {
        tasks: vec![heartbeat, reconcile],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerStatus;
    use crate::testing::{paused, playing, synced_session, FakePlayer, PlayerCall, RecordingSink};

    const VIDEO: &str = "dQw4w9WgXcQ";
    const OTHER: &str = "bbbbbbbbbbb";

    #[tokio::test(start_paused = true)]
    async fn walks_uninitialized_ready_synced() {
        let sink = Arc::new(RecordingSink::default());
        let player = FakePlayer::at(VIDEO, 0.0, PlayerStatus::Cued);
        let mut session = SyncSession::new(player, sink.clone());
        assert_eq!(session.phase(), SyncPhase::Uninitialized);

        // a snapshot before the player is ready waits
        session.apply_room_snapshot(playing(VIDEO, 42.0), 0);
        assert_eq!(session.phase(), SyncPhase::Uninitialized);
        assert!(session.player().calls.is_empty());

        session.handle_player_event(PlayerEvent::Ready);
        assert_eq!(session.phase(), SyncPhase::Synced);
        assert_eq!(
            session.player().calls,
            vec![PlayerCall::Seek(42.0), PlayerCall::Play]
        );
        assert!(sink.states().is_empty());
    }

    #[test]
    fn initial_sync_seeks_even_when_paused() {
        let sink = Arc::new(RecordingSink::default());
        let player = FakePlayer::at(VIDEO, 0.0, PlayerStatus::Cued);
        let mut session = SyncSession::new(player, sink);
        session.handle_player_event(PlayerEvent::Ready);
        assert_eq!(session.phase(), SyncPhase::Ready);

        session.apply_room_snapshot(paused(VIDEO, 300.0), 0);
        assert_eq!(session.phase(), SyncPhase::Synced);
        assert_eq!(session.player().calls, vec![PlayerCall::Seek(300.0)]);
    }

    #[test]
    fn initial_sync_retries_after_player_error() {
        let sink = Arc::new(RecordingSink::default());
        let mut player = FakePlayer::at(VIDEO, 0.0, PlayerStatus::Cued);
        player.fail = Some(crate::player::PlayerError::NotReady);
        let mut session = SyncSession::new(player, sink);
        session.handle_player_event(PlayerEvent::Ready);
        session.apply_room_snapshot(playing(VIDEO, 10.0), 0);
        assert_eq!(session.phase(), SyncPhase::Ready);

        session.player_mut().fail = None;
        session.apply_remote_state(playing(VIDEO, 12.0));
        assert_eq!(session.phase(), SyncPhase::Synced);
    }

    #[test]
    fn empty_room_syncs_without_a_video() {
        let sink = Arc::new(RecordingSink::default());
        let player = FakePlayer::empty();
        let mut session = SyncSession::new(player, sink);
        session.handle_player_event(PlayerEvent::Ready);
        session.apply_room_snapshot(PlaybackState::initial(None), 0);
        assert_eq!(session.phase(), SyncPhase::Synced);
    }

    #[test]
    fn paused_client_catches_up_with_playing_leader() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 115.0, PlayerStatus::Paused),
            paused(VIDEO, 115.0),
        );

        session.apply_remote_state(playing(VIDEO, 120.0));
        assert_eq!(
            session.player().calls,
            vec![PlayerCall::Seek(120.0), PlayerCall::Play]
        );
        assert!(sink.states().is_empty());
    }

    #[test]
    fn remote_state_clears_active_flag() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 10.0, PlayerStatus::Paused),
            paused(VIDEO, 10.0),
        );
        session.handle_player_event(PlayerEvent::Play);
        assert!(session.is_active());
        assert_eq!(sink.states().len(), 1);

        session.apply_remote_state(paused(VIDEO, 10.0));
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_aged_by_server_clock() {
        let sink = Arc::new(RecordingSink::default());
        let player = FakePlayer::at(VIDEO, 0.0, PlayerStatus::Cued);
        let mut session = SyncSession::new(player, sink);
        session.handle_player_event(PlayerEvent::Ready);

        let mut state = playing(VIDEO, 60.0);
        state.server_timestamp = 1_000_000;
        session.apply_room_snapshot(state, 1_005_000);
        assert_eq!(
            session.player().calls,
            vec![PlayerCall::Seek(65.0), PlayerCall::Play]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_heartbeat() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 5.0, PlayerStatus::Paused),
            paused(VIDEO, 5.0),
        );
        session.handle_player_event(PlayerEvent::Play);
        let baseline = sink.states().len();
        let session = session.shared();
        let (_tx, rx) = watch::channel(true);

        let handle = spawn_sync_tasks(&session, rx);
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(sink.states().len(), baseline + 2);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.states().len(), baseline + 2);
    }

    #[test]
    fn switching_rooms_resyncs_and_turns_passive() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 100.0, PlayerStatus::Paused),
            paused(VIDEO, 100.0),
        );
        session.handle_player_event(PlayerEvent::Play);
        assert!(session.is_active());
        let sent = sink.states().len();

        // the next room is paused further in, on another video
        session.apply_room_snapshot(paused(OTHER, 300.0), 0);

        assert_eq!(session.phase(), SyncPhase::Synced);
        assert!(!session.is_active());
        assert_eq!(
            session.player().calls,
            vec![PlayerCall::Load(OTHER.to_string()), PlayerCall::Seek(300.0)]
        );
        assert!(!session.heartbeat());
        assert_eq!(sink.states().len(), sent);
    }

    #[test]
    fn snapshot_overrides_a_settling_local_seek() {
        let (mut session, _sink) = synced_session(
            FakePlayer::at(VIDEO, 10.0, PlayerStatus::Playing),
            playing(VIDEO, 10.0),
        );
        session.player_mut().seek(45.0).unwrap();
        session.handle_player_event(PlayerEvent::Seeked);
        session.player_mut().calls.clear();

        session.apply_room_snapshot(paused(VIDEO, 80.0), 0);
        assert_eq!(
            session.player().calls,
            vec![PlayerCall::Seek(80.0), PlayerCall::Pause]
        );
        assert_eq!(session.phase(), SyncPhase::Synced);
    }

    #[test]
    fn failed_resync_is_retried_on_the_next_tick() {
        let (mut session, _sink) = synced_session(
            FakePlayer::at(VIDEO, 10.0, PlayerStatus::Playing),
            playing(VIDEO, 10.0),
        );
        session.player_mut().fail = Some(crate::player::PlayerError::NotReady);
        session.apply_room_snapshot(paused(VIDEO, 80.0), 0);
        assert_eq!(session.phase(), SyncPhase::Ready);

        session.player_mut().fail = None;
        session.reconcile_tick();
        assert_eq!(session.phase(), SyncPhase::Synced);
        assert_eq!(session.player().time, 80.0);
    }

    /// Leader keeps heartbeating into the room it rejoins after a reconnect
    #[tokio::test(start_paused = true)]
    async fn rejoin_with_own_state_resumes_the_heartbeat() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 5.0, PlayerStatus::Paused),
            paused(VIDEO, 5.0),
        );
        session.player_mut().play().unwrap();
        session.handle_player_event(PlayerEvent::Play);
        let session = session.shared();
        let (tx, rx) = watch::channel(true);
        let _handle = spawn_sync_tasks(&session, rx);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(sink.states().len(), 2);

        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.states().len(), 2);

        // the room still holds what this client sent last
        let last = sink.states().pop().unwrap();
        let server_time = last.server_timestamp;
        session.lock().apply_room_snapshot(last, server_time);
        assert!(session.lock().is_active());
        assert_eq!(session.lock().phase(), SyncPhase::Synced);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(sink.states().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_into_a_moved_room_stops_the_heartbeat() {
        let (mut session, sink) = synced_session(
            FakePlayer::at(VIDEO, 5.0, PlayerStatus::Paused),
            paused(VIDEO, 5.0),
        );
        session.player_mut().play().unwrap();
        session.handle_player_event(PlayerEvent::Play);
        let session = session.shared();
        let (tx, rx) = watch::channel(true);
        let _handle = spawn_sync_tasks(&session, rx);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(sink.states().len(), 2);

        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        // someone else took over while this client was away
        session.lock().apply_room_snapshot(paused(VIDEO, 50.0), 0);
        assert!(!session.lock().is_active());

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.states().len(), 2);
        assert_eq!(session.lock().player().time, 50.0);
    }
}
