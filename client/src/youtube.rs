use url::Url;

const VIDEO_ID_LEN: usize = 11;

/// Check if a URL is a YouTube URL
pub fn is_youtube_url(input: &str) -> bool {
    Url::parse(input.trim())
        .ok()
        .and_then(|url| url.host_str().map(is_youtube_host))
        .unwrap_or(false)
}

fn is_youtube_host(host: &str) -> bool {
    let host = host.trim_start_matches("www.").trim_start_matches("m.");
    host == "youtube.com" || host == "youtu.be" || host == "music.youtube.com"
}

/// Extract video ID from YouTube URL
pub fn extract_video_id(input: &str) -> Option<String> {
    let url = Url::parse(input.trim()).ok()?;
    let host = url.host_str()?;
    if !is_youtube_host(host) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let id = if host.ends_with("youtu.be") {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts") | Some("live") | Some("embed") => segments.next().map(str::to_string),
            _ => None,
        }
    };

    id.filter(|id| is_video_id(id))
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == VIDEO_ID_LEN
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// Accept either a YouTube link or a bare video id, as typed into the room's video form
pub fn normalize_video_input(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if is_video_id(trimmed) {
        return Some(trimmed.to_string());
    }
    extract_video_id(trimmed)
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
