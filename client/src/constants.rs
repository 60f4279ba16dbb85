use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the active client re-publishes its playback state
pub const SYNC_INTERVAL: Duration = Duration::from_millis(2000);

/// How often the reconciler re-evaluates the local player without a new state
pub const RECONCILE_INTERVAL: Duration = Duration::from_millis(1000);

/// Drift in seconds tolerated before a corrective seek
pub const TIME_SYNC_THRESHOLD: f64 = 1.0;

/// Window after a local seek during which the reconciler never seeks back
pub const SEEK_SUPPRESSION: Duration = Duration::from_millis(500);

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

pub const CHAT_LOG_LIMIT: usize = 100;
