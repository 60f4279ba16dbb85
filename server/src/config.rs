use std::env;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3005;
const DEFAULT_CAPACITY: usize = 12;
const MIN_CAPACITY: usize = 2;
const MAX_CAPACITY: usize = 32;
const DEFAULT_CHAT_HISTORY: usize = 100;

/// Runtime settings, read once from the environment at start-up
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub room_capacity: usize,
    pub chat_history: usize,
    /// JSON file of category videos loaded at start-up
    pub catalog_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            room_capacity: DEFAULT_CAPACITY,
            chat_history: DEFAULT_CHAT_HISTORY,
            catalog_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = lookup("PORT")
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let room_capacity = normalize_capacity(
            lookup("WATCHPARTY_ROOM_CAPACITY").and_then(|val| val.parse().ok()),
        );
        let chat_history = lookup("WATCHPARTY_CHAT_HISTORY")
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_CHAT_HISTORY);
        let catalog_path = lookup("WATCHPARTY_CATALOG")
            .filter(|val| !val.trim().is_empty())
            .map(PathBuf::from);

        Self {
            port,
            room_capacity,
            chat_history,
            catalog_path,
        }
    }
}

fn normalize_capacity(requested: Option<usize>) -> usize {
    requested
        .map(|value| value.clamp(MIN_CAPACITY, MAX_CAPACITY))
        .unwrap_or(DEFAULT_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.room_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.chat_history, DEFAULT_CHAT_HISTORY);
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn clamps_capacity_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("PORT", "not-a-port"),
            ("WATCHPARTY_ROOM_CAPACITY", "500"),
            ("WATCHPARTY_CHAT_HISTORY", "20"),
            ("WATCHPARTY_CATALOG", "videos.json"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.room_capacity, MAX_CAPACITY);
        assert_eq!(config.chat_history, 20);
        assert_eq!(config.catalog_path, Some(PathBuf::from("videos.json")));
    }
}
