use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::protocol::{CatalogVideo, RoomRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message} ({status})")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Next => "next",
            Direction::Prev => "prev",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRoom {
    pub room_name: String,
    pub category: String,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
}

/// Body of a catalog addition; the category comes from the path
#[derive(Debug, Clone, Serialize)]
pub struct NewVideo {
    pub video_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// HTTP side of the relay, addressed from the same host as its WebSocket
#[derive(Clone)]
pub struct RoomsApi {
    client: Client,
    base: Url,
}

impl RoomsApi {
    pub fn from_ws_url(ws_url: &str) -> Result<Self, ApiError> {
        let base = http_base_from_ws(ws_url)
            .ok_or_else(|| ApiError::InvalidUrl(ws_url.to_string()))?;
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn health(&self) -> Result<StatusCode, ApiError> {
        let response = self
            .client
            .get(self.url("healthz")?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(response.status())
    }

    pub async fn list_rooms(&self, category: Option<&str>) -> Result<Vec<RoomRecord>, ApiError> {
        let mut request = self.client.get(self.url("rooms")?).timeout(REQUEST_TIMEOUT);
        if let Some(category) = category {
            request = request.query(&[("category", category)]);
        }
        decode(request.send().await?).await
    }

    pub async fn get_room(&self, room_id: &str) -> Result<RoomRecord, ApiError> {
        let path = format!("rooms/{}", urlencoding::encode(room_id));
        let response = self
            .client
            .get(self.url(&path)?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn create_room(&self, room: &CreateRoom) -> Result<RoomRecord, ApiError> {
        let response = self
            .client
            .post(self.url("rooms")?)
            .json(room)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    /// The public room after or before `room_id` in its category, wrapping around
    pub async fn neighbor(
        &self,
        room_id: &str,
        direction: Direction,
    ) -> Result<RoomRecord, ApiError> {
        let path = format!("rooms/{}/neighbor", urlencoding::encode(room_id));
        let response = self
            .client
            .get(self.url(&path)?)
            .query(&[("direction", direction.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    /// Find or create the public room for a category slug such as `live-music`
    pub async fn category_room(&self, slug: &str) -> Result<RoomRecord, ApiError> {
        let path = format!("categories/{}/room", urlencoding::encode(slug));
        let response = self
            .client
            .post(self.url(&path)?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    /// A category's videos, newest first
    pub async fn category_videos(&self, category: &str) -> Result<Vec<CatalogVideo>, ApiError> {
        let response = self
            .client
            .get(self.url(&category_videos_path(category))?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn add_category_video(
        &self,
        category: &str,
        video: &NewVideo,
    ) -> Result<CatalogVideo, ApiError> {
        let response = self
            .client
            .post(self.url(&category_videos_path(category))?)
            .json(video)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status,
        message: error_message(&body, status),
    })
}

fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

/// `"Live Music"` -> `"live-music"`
pub fn category_slug(category: &str) -> String {
    category
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

fn category_videos_path(category: &str) -> String {
    format!(
        "categories/{}/videos",
        urlencoding::encode(&category_slug(category))
    )
}

fn http_base_from_ws(ws_url: &str) -> Option<Url> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/");
    http.set_query(None);
    http.set_fragment(None);
    Some(http)
}

pub fn health_url_from_ws(ws_url: &str) -> Option<String> {
    http_base_from_ws(ws_url)
        .and_then(|base| base.join("healthz").ok())
        .map(|url| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_http_urls_from_socket_url() {
        assert_eq!(
            health_url_from_ws("ws://localhost:3005/ws").as_deref(),
            Some("http://localhost:3005/healthz")
        );
        assert_eq!(
            health_url_from_ws("wss://party.example/ws?x=1").as_deref(),
            Some("https://party.example/healthz")
        );
        assert_eq!(health_url_from_ws("http://localhost:3005"), None);
    }

    #[test]
    fn builds_escaped_room_urls() {
        let api = RoomsApi::from_ws_url("ws://localhost:3005/ws").unwrap();
        let url = api.url(&format!("rooms/{}/neighbor", urlencoding::encode("a b"))).unwrap();
        assert_eq!(url.as_str(), "http://localhost:3005/rooms/a%20b/neighbor");
        assert!(RoomsApi::from_ws_url("not a url").is_err());
    }

    #[test]
    fn category_names_become_slugs() {
        assert_eq!(category_slug("Live Music"), "live-music");
        assert_eq!(category_slug("  Film "), "film");
        assert_eq!(
            category_videos_path("Science And Tech"),
            "categories/science-and-tech/videos"
        );

        let video = NewVideo {
            video_id: "dQw4w9WgXcQ".to_string(),
            title: "Clip".to_string(),
            channel_title: None,
            duration: Some(212),
        };
        let json = serde_json::to_value(&video).unwrap();
        assert_eq!(json["duration"], 212);
        assert!(json.get("channel_title").is_none());
    }

    #[test]
    fn surfaces_server_error_messages() {
        assert_eq!(
            error_message(r#"{"error":"Room not found"}"#, StatusCode::NOT_FOUND),
            "Room not found"
        );
        assert_eq!(
            error_message("<html>", StatusCode::BAD_GATEWAY),
            "Bad Gateway"
        );

        let err = ApiError::Status {
            status: StatusCode::NOT_FOUND,
            message: "Room not found".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Room not found (404 Not Found)");
    }
}
