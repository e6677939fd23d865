use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::job::SeparationMode;
use crate::models::submission::{
    InferenceRequest, SeparationForm, SubmissionResponse, TrainingForm,
};
use crate::routes::ApiError;
use crate::services::producer::Upload;

type Accepted = (StatusCode, Json<SubmissionResponse>);

/// POST /api/v1/separate — upload a song for vocal/instrumental separation.
///
/// Multipart fields: `user_id`, `artist`, `audio` (file) and an optional `vc`
/// flag selecting voice conversion mode.
pub async fn submit_separation(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Accepted, ApiError> {
    let mut user_id = String::new();
    let mut artist = String::new();
    let mut vc = false;
    let mut audio = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => user_id = field.text().await?,
            "artist" => artist = field.text().await?,
            "vc" => vc = is_truthy(&field.text().await?),
            "audio" => audio = Some(read_upload(field).await?),
            _ => {}
        }
    }

    let form = SeparationForm {
        user_id,
        artist,
        vc,
    };
    form.validate()?;
    let audio = audio.ok_or_else(|| ApiError::bad_request("missing audio file"))?;

    let mode = if form.vc {
        SeparationMode::VoiceConversion
    } else {
        SeparationMode::Library
    };
    let receipt = state
        .producer
        .submit_separation(&form.user_id, &form.artist, audio, mode)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// POST /api/v1/training — upload a voice dataset and train a model on it.
///
/// Multipart fields: `user_id`, `artist` and one or more `files`.
pub async fn submit_training(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Accepted, ApiError> {
    let mut user_id = String::new();
    let mut artist = String::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => user_id = field.text().await?,
            "artist" => artist = field.text().await?,
            "files" => files.push(read_upload(field).await?),
            _ => {}
        }
    }

    let form = TrainingForm { user_id, artist };
    form.validate()?;

    let receipt = state
        .producer
        .submit_training(&form.user_id, &form.artist, files)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// POST /api/v1/inference — convert a song separated in voice conversion
/// mode with the artist's trained model.
pub async fn submit_inference(
    State(state): State<AppState>,
    Json(request): Json<InferenceRequest>,
) -> Result<Accepted, ApiError> {
    request.validate()?;

    let receipt = state
        .producer
        .submit_inference(&request.user_id, &request.artist, &request.filename)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

async fn read_upload(field: Field<'_>) -> Result<Upload, ApiError> {
    // Browsers may send a full client path.
    let filename = field
        .file_name()
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("uploaded file has no name"))?;
    let data = field.bytes().await?;
    if data.is_empty() {
        return Err(ApiError::bad_request(format!("{filename} is empty")));
    }

    Ok(Upload {
        filename,
        data: data.to_vec(),
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
