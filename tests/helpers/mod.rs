//! Test helper utilities for E2E testing
#![allow(dead_code)]

use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

/// Response from the submission endpoints
#[derive(Debug, Deserialize)]
pub struct SubmissionResponse {
    pub message_id: String,
    pub stage: String,
    pub status: String,
}

/// Per-stage progress from GET /api/v1/status
#[derive(Debug, Deserialize)]
pub struct StageStatuses {
    pub separation: String,
    pub training: String,
    pub inference: String,
}

/// Response from GET /api/v1/status/{user_id}/{artist}
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub user_id: String,
    pub artist: String,
    pub origin_url: Option<String>,
    pub vocal_url: Option<String>,
    pub instrum_url: Option<String>,
    pub vc_source_url: Option<String>,
    pub trained: bool,
    pub model_url: Option<String>,
    pub vc_vocal_url: Option<String>,
    pub stages: StageStatuses,
}

/// A tiny but valid 16-bit mono PCM WAV file of silence.
pub fn silent_wav(samples: usize) -> Vec<u8> {
    let data_len = (samples * 2) as u32;
    let mut wav = Vec::with_capacity(44 + samples * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&44_100u32.to_le_bytes());
    wav.extend_from_slice(&(44_100u32 * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + samples * 2, 0);
    wav
}

fn wav_part(filename: &str, data: Vec<u8>) -> Result<multipart::Part, reqwest::Error> {
    multipart::Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str("audio/wav")
}

async fn submission(
    response: reqwest::Response,
) -> Result<SubmissionResponse, Box<dyn std::error::Error>> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Submission failed with status {}: {}", status, error_text).into());
    }
    Ok(response.json::<SubmissionResponse>().await?)
}

/// Upload a song to the separation endpoint
pub async fn submit_separation(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    artist: &str,
    filename: &str,
    vc: bool,
) -> Result<SubmissionResponse, Box<dyn std::error::Error>> {
    let form = multipart::Form::new()
        .text("user_id", user_id.to_string())
        .text("artist", artist.to_string())
        .text("vc", vc.to_string())
        .part("audio", wav_part(filename, silent_wav(44_100))?);

    let response = client
        .post(format!("{}/api/v1/separate", base_url))
        .multipart(form)
        .send()
        .await?;
    submission(response).await
}

/// Upload a training dataset
pub async fn submit_training(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    artist: &str,
    filenames: &[&str],
) -> Result<SubmissionResponse, Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new()
        .text("user_id", user_id.to_string())
        .text("artist", artist.to_string());
    for filename in filenames {
        form = form.part("files", wav_part(filename, silent_wav(44_100))?);
    }

    let response = client
        .post(format!("{}/api/v1/training", base_url))
        .multipart(form)
        .send()
        .await?;
    submission(response).await
}

/// Request voice conversion of a separated song
pub async fn submit_inference(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    artist: &str,
    filename: &str,
) -> Result<SubmissionResponse, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/inference", base_url))
        .json(&serde_json::json!({
            "user_id": user_id,
            "artist": artist,
            "filename": filename,
        }))
        .send()
        .await?;
    submission(response).await
}

/// Poll the status record until `done` holds (with timeout)
pub async fn poll_status<F>(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    artist: &str,
    timeout_secs: u64,
    done: F,
) -> Result<StatusResponse, Box<dyn std::error::Error>>
where
    F: Fn(&StatusResponse) -> bool,
{
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/status/{}/{}", base_url, user_id, artist))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            sleep(Duration::from_millis(500)).await;
            continue;
        }
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let record = response.json::<StatusResponse>().await?;
        if done(&record) {
            return Ok(record);
        }
        if attempt % 10 == 0 && attempt > 0 {
            println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Record not complete within {} seconds", timeout_secs).into())
}
