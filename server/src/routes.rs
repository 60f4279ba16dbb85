use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::RoomError;
use crate::protocol::{CatalogVideo, RoomRecord};
use crate::state::{Direction, NewRoom, NewVideo};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListRoomsQuery {
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NeighborQuery {
    direction: Direction,
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Query(query): Query<ListRoomsQuery>,
) -> Json<Vec<RoomRecord>> {
    let category = query
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    Json(state.server_state.public_rooms(category))
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(new_room): Json<NewRoom>,
) -> Result<Json<RoomRecord>, RoomError> {
    state.server_state.create_room(new_room).map(Json)
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomRecord>, RoomError> {
    state
        .server_state
        .room(&room_id)
        .map(Json)
        .ok_or(RoomError::NotFound)
}

pub async fn neighbor_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<NeighborQuery>,
) -> Result<Json<RoomRecord>, RoomError> {
    state
        .server_state
        .neighbor(&room_id, query.direction)
        .map(Json)
}

pub async fn category_room(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<RoomRecord>, RoomError> {
    state.server_state.category_room(&slug).map(Json)
}

pub async fn category_videos(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Json<Vec<CatalogVideo>> {
    Json(state.server_state.category_videos(&slug))
}

pub async fn add_category_video(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(video): Json<NewVideo>,
) -> Result<Json<CatalogVideo>, RoomError> {
    state.server_state.add_video(&slug, video).map(Json)
}
