use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Identity announced in presence. Kept on disk so a user is recognised
/// across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl Profile {
    pub fn generate() -> Self {
        let user_id = Uuid::new_v4().to_string();
        let display_name = format!("Guest {}", &user_id[..8]);
        Self {
            user_id,
            display_name,
            image: None,
        }
    }
}

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::at(Self::resolve_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<Profile> {
        fs::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
    }

    /// Load the saved profile, creating and saving a fresh one if none is readable
    pub fn load_or_create(&self) -> Result<Profile> {
        if let Some(profile) = self.load() {
            return Ok(profile);
        }
        let profile = Profile::generate();
        self.save(&profile)?;
        tracing::info!("Created new profile {}", profile.user_id);
        Ok(profile)
    }

    pub fn save(&self, profile: &Profile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create profile directory")?;
        }
        let payload = serde_json::to_vec_pretty(profile)?;
        fs::write(&self.path, payload).context("Failed to write profile")?;
        Ok(())
    }

    fn resolve_path() -> PathBuf {
        if let Some(dirs) = ProjectDirs::from("com", "watchparty", "Watchparty") {
            dirs.data_dir().join("profile.json")
        } else {
            env::temp_dir().join("watchparty-profile.json")
        }
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}
