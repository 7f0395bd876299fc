//! Image upload endpoint.
//!
//! Accepts a multipart form with an `image` field, stores it under the media
//! directory with a time-derived name and answers with the URL it is served
//! from.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

/// Multipart field the image is expected in.
pub const IMAGE_FIELD: &str = "image";

const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

/// Directory uploaded images are written to and served from.
#[derive(Debug, Clone)]
pub struct MediaDir(pub Arc<PathBuf>);

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Error parsing form")]
    Form(#[from] MultipartError),
    #[error("Error retrieving the file")]
    MissingFile,
    #[error("Invalid file type. Only images are allowed.")]
    InvalidType,
    #[error("Failed to save the file")]
    Storage(#[from] io::Error),
}

impl UploadError {
    fn status(&self) -> StatusCode {
        match self {
            // Oversized bodies surface here with 413 rather than a generic 400.
            UploadError::Form(error) => error.status(),
            UploadError::MissingFile | UploadError::InvalidType => StatusCode::BAD_REQUEST,
            UploadError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = ?self, "upload failed");
        }
        let body = UploadResponse {
            message: self.to_string(),
            url: None,
        };
        (status, Json(body)).into_response()
    }
}

pub async fn upload_image(
    State(MediaDir(media_dir)): State<MediaDir>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        if field.file_name().is_none() {
            return Err(UploadError::MissingFile);
        }
        if !is_allowed_image(field.content_type()) {
            return Err(UploadError::InvalidType);
        }

        let extension = extension_of(field.file_name());
        let data = field.bytes().await?;
        let name = store(&media_dir, &extension, &data).await?;
        info!(file = %name, bytes = data.len(), "image uploaded");

        return Ok(Json(UploadResponse {
            message: "File uploaded successfully".to_string(),
            url: Some(format!("/media/{name}")),
        }));
    }

    Err(UploadError::MissingFile)
}

fn is_allowed_image(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|declared| {
        ALLOWED_CONTENT_TYPES
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(declared))
    })
}

/// Extension of the client's file name including the leading dot, or an
/// empty string. Only the extension is kept, never any client path.
fn extension_of(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

async fn store(media_dir: &Path, extension: &str, data: &[u8]) -> io::Result<String> {
    fs::create_dir_all(media_dir).await?;

    let name = format!("{}{extension}", unix_nanos());
    // `create_new` refuses to overwrite if two uploads land on the same nanosecond.
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(media_dir.join(&name))
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(name)
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}
