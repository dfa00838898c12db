use actix_multipart::Multipart;
use actix_web::{http::header, web, HttpRequest};
use futures::{StreamExt, TryStreamExt};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::ApiError;

/// Multipart part carrying the product image.
pub const FILE_FIELD: &str = "file";

#[derive(Debug)]
pub struct UploadedFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

/// Text fields and optional image of a create/update request. Nothing is
/// written to disk until the request has been authorized.
#[derive(Debug, Default)]
pub struct Submission {
    pub fields: HashMap<String, String>,
    /// Fields sent as JSON arrays or objects; these never count as text.
    pub mistyped: Vec<String>,
    pub file: Option<UploadedFile>,
}

pub async fn read_submission(
    req: &HttpRequest,
    payload: web::Payload,
    limit: usize,
) -> Result<Submission, ApiError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        read_multipart(Multipart::new(req.headers(), payload), limit).await
    } else {
        let body = read_body(payload, limit).await?;
        submission_from_json(&body)
    }
}

async fn read_multipart(mut multipart: Multipart, limit: usize) -> Result<Submission, ApiError> {
    let mut submission = Submission::default();
    let mut received = 0usize;

    while let Some(mut field) = multipart
        .try_next()
        .await
        .map_err(|e| ApiError::Upload(e.to_string()))?
    {
        let disposition = field.content_disposition().clone();
        let name = disposition.get_name().unwrap_or_default().to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| ApiError::Upload(e.to_string()))?
        {
            received += chunk.len();
            if received > limit {
                return Err(ApiError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }

        match disposition.get_filename() {
            Some(filename) if name == FILE_FIELD => {
                debug!("Received upload {} ({} bytes)", filename, data.len());
                submission.file = Some(UploadedFile {
                    original_name: filename.to_string(),
                    bytes: data,
                });
            }
            Some(filename) => {
                debug!("Ignoring unexpected file part {} ({})", name, filename);
            }
            None => {
                let value = String::from_utf8(data)
                    .map_err(|_| ApiError::Upload(format!("{} is not valid UTF-8", name)))?;
                submission.fields.insert(name, value);
            }
        }
    }

    Ok(submission)
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(ApiError::PayloadTooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Flattens a JSON object into the same textual form multipart fields take.
/// `null` counts as absent; arrays and objects are recorded as mistyped.
pub fn submission_from_json(body: &[u8]) -> Result<Submission, ApiError> {
    let mut submission = Submission::default();
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(submission);
    }

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)
        .map_err(|_| ApiError::Upload("request body must be a JSON object".to_string()))?;

    for (key, value) in object {
        match value {
            serde_json::Value::Null => {}
            serde_json::Value::String(text) => {
                submission.fields.insert(key, text);
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                submission.mistyped.push(key);
            }
            scalar => {
                submission.fields.insert(key, scalar.to_string());
            }
        }
    }

    Ok(submission)
}

#[derive(Debug, Clone)]
pub struct UploadStorage {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStorage {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        UploadStorage {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Writes the file under a fresh random name and returns that name.
    pub async fn save(&self, file: &UploadedFile) -> io::Result<String> {
        let filename = stored_name(&file.original_name);
        tokio::fs::write(self.dir.join(&filename), &file.bytes).await?;
        Ok(filename)
    }

    /// Best-effort cleanup of a file saved for a request that then failed.
    pub async fn remove(&self, filename: &str) {
        if let Err(e) = tokio::fs::remove_file(self.dir.join(filename)).await {
            warn!("Failed to remove orphaned upload {}: {}", filename, e);
        }
    }
}

fn stored_name(original_name: &str) -> String {
    let random: [u8; 16] = rand::random();
    let stem: String = random.iter().map(|byte| format!("{:02x}", byte)).collect();

    let extension = Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("{}.{}", stem, ext.to_ascii_lowercase()),
        None => stem,
    }
}
