use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failures of room operations, shared by the HTTP API and the socket relay
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found")]
    NotFound,
    #[error("Room is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("Passcode required")]
    PasscodeRequired,
    #[error("Invalid passcode")]
    InvalidPasscode,
    #[error("Not in a room")]
    NotInRoom,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("Chat message exceeds {0} characters")]
    ChatTooLong(usize),
    #[error("Not a YouTube video id: {0}")]
    InvalidVideoId(String),
}

impl RoomError {
    fn status(&self) -> StatusCode {
        match self {
            RoomError::NotFound => StatusCode::NOT_FOUND,
            RoomError::Full { .. } => StatusCode::CONFLICT,
            RoomError::PasscodeRequired | RoomError::InvalidPasscode => StatusCode::FORBIDDEN,
            RoomError::NotInRoom
            | RoomError::EmptyField(_)
            | RoomError::ChatTooLong(_)
            | RoomError::InvalidVideoId(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
