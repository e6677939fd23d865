use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::status::RecordKey;
use crate::models::submission::StatusResponse;
use crate::routes::ApiError;

/// GET /api/v1/status/{user_id}/{artist} — progress of every stage for one artist.
pub async fn get_status(
    State(state): State<AppState>,
    Path((user_id, artist)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let key = RecordKey::new(user_id, artist);
    match state.status.get(&key).await? {
        Some(record) => Ok(Json(record.into())),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no record for {}/{}", key.user_id, key.artist),
        )),
    }
}
