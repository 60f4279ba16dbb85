//! A category's videos, newest first, as the server lists them

use crate::protocol::CatalogVideo;

#[derive(Debug, Clone, Default)]
pub struct Playlist {
    videos: Vec<CatalogVideo>,
}

impl Playlist {
    pub fn new(videos: Vec<CatalogVideo>) -> Self {
        Self { videos }
    }

    pub fn videos(&self) -> &[CatalogVideo] {
        &self.videos
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// Zero-based
    pub fn get(&self, index: usize) -> Option<&CatalogVideo> {
        self.videos.get(index)
    }

    pub fn position(&self, video_id: &str) -> Option<usize> {
        self.videos.iter().position(|video| video.video_id == video_id)
    }

    /// The entry after `video_id`. Playback stops after the last entry and
    /// for videos that are not listed.
    pub fn next_after(&self, video_id: &str) -> Option<&CatalogVideo> {
        self.position(video_id).and_then(|index| self.videos.get(index + 1))
    }
}
