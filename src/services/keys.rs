//! Deterministic blob keys.
//!
//! Every key is a pure function of the job identity, so a rerun of any stage
//! writes to exactly the keys of the previous run and the next stage can find
//! its inputs without being told where they are.

use std::path::Path;

/// File name without its extension: `song.wav` -> `song`.
pub fn stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

pub fn origin(user_id: &str, filename: &str) -> String {
    format!("{user_id}/origin/{filename}")
}

/// Separated stems for the user's library.
pub fn separation_vocals(user_id: &str, filename: &str) -> String {
    format!("{user_id}/separation/{}_vocals.wav", stem(filename))
}

pub fn separation_instrum(user_id: &str, filename: &str) -> String {
    format!("{user_id}/separation/{}_instrum.wav", stem(filename))
}

/// Separated stems feeding a voice conversion run.
pub fn vc_source_vocals(user_id: &str, filename: &str) -> String {
    format!("{user_id}/separation/vc/{}_vocals.wav", stem(filename))
}

pub fn vc_source_instrum(user_id: &str, filename: &str) -> String {
    format!("{user_id}/separation/vc/{}_instrum.wav", stem(filename))
}

pub fn dataset_prefix(user_id: &str, artist: &str) -> String {
    format!("{user_id}/dataset/{artist}/")
}

pub fn dataset_file(user_id: &str, artist: &str, filename: &str) -> String {
    format!("{}{filename}", dataset_prefix(user_id, artist))
}

/// Location of the trained voice model of an artist.
pub fn model_prefix(user_id: &str, artist: &str) -> String {
    format!("{user_id}/training/{artist}/")
}

pub fn model_file(user_id: &str, artist: &str, filename: &str) -> String {
    format!("{}{filename}", model_prefix(user_id, artist))
}

pub fn inference_output(user_id: &str, artist: &str, filename: &str) -> String {
    format!("{user_id}/inference/{artist}/{}_output.wav", stem(filename))
}

/// Last path segment of a key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
