//! Video management: upload (multipart), list, select, serve. Selecting a
//! video broadcasts `{video_updated, video_src}` on the duplex channel so
//! every connected client switches its player.

use crate::error::AppError;
use crate::state::AppState;
use crate::websocket::{video_updated_message, ClientRegistry};
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub async fn upload_video(
    state: web::Data<AppState>,
    registry: web::Data<ClientRegistry>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let videos_dir = PathBuf::from(state.get_config().storage.videos_dir);
    std::fs::create_dir_all(&videos_dir)?;

    let mut saved = Vec::new();
    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(sanitize_filename)
            .ok_or_else(|| AppError::BadRequest("Upload part has no filename".to_string()))?;

        let target = unique_path(&videos_dir, &file_name);
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("Upload read error: {}", e)))?;
            bytes.extend_from_slice(&chunk);
        }
        std::fs::write(&target, &bytes)?;

        let stored_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file_name)
            .to_string();
        info!("Video uploaded: {} ({} bytes)", stored_name, bytes.len());
        saved.push(stored_name);
    }

    if saved.is_empty() {
        return Err(AppError::BadRequest("No file in upload".to_string()));
    }

    // New uploads switch the clients to the first saved file
    registry.broadcast(video_updated_message(&format!(
        "/api/v1/videos/{}",
        saved[0]
    )));

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "uploaded": saved
    })))
}

pub async fn list_videos(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let videos_dir = PathBuf::from(state.get_config().storage.videos_dir);

    let mut entries: Vec<(std::time::SystemTime, String)> = match std::fs::read_dir(&videos_dir) {
        Ok(dir) => dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.file_name().to_str()?.to_string()))
            })
            .collect(),
        // Directory appears on first upload
        Err(_) => Vec::new(),
    };

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    let videos: Vec<String> = entries.into_iter().map(|(_, name)| name).collect();

    Ok(HttpResponse::Ok().json(json!({ "videos": videos })))
}

#[derive(Debug, Deserialize)]
pub struct SelectVideoRequest {
    pub filename: String,
}

pub async fn select_video(
    state: web::Data<AppState>,
    registry: web::Data<ClientRegistry>,
    body: web::Json<SelectVideoRequest>,
) -> Result<HttpResponse, AppError> {
    let filename = sanitize_filename(&body.filename);
    let videos_dir = PathBuf::from(state.get_config().storage.videos_dir);

    if !videos_dir.join(&filename).is_file() {
        return Err(AppError::NotFound(format!("Video {}", filename)));
    }

    let video_src = format!("/api/v1/videos/{}", filename);
    info!("Video selected: {}", filename);
    registry.broadcast(video_updated_message(&video_src));

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "video_src": video_src
    })))
}

pub async fn serve_video(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let filename = sanitize_filename(&path.into_inner());
    let full_path = PathBuf::from(state.get_config().storage.videos_dir).join(&filename);

    let bytes = std::fs::read(&full_path)
        .map_err(|_| AppError::NotFound(format!("Video {}", filename)))?;

    let content_type = match full_path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        _ => {
            warn!("Serving video with unknown extension: {}", filename);
            "application/octet-stream"
        }
    };

    Ok(HttpResponse::Ok().content_type(content_type).body(bytes))
}

/// Strip any path components so uploads and lookups stay inside the videos
/// directory.
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string()
}

/// Resolve a collision-free target path by appending a counter before the
/// extension.
fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let extension = Path::new(file_name).extension().and_then(|e| e.to_str());

    let mut counter = 1;
    loop {
        let name = match extension {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
