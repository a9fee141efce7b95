//! Report generation endpoint. The duplex channel's report capability covers
//! the live flow; this endpoint regenerates a report for a finished session,
//! defaulting to the most recent session folder.

use crate::agents::report::ReportComposer;
use crate::completion::CompletionClient;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct ReportRequest {
    /// Session folder name under the output directory; latest when omitted
    pub session_folder: Option<String>,
}

pub async fn generate_report(
    state: web::Data<AppState>,
    client: web::Data<Arc<dyn CompletionClient>>,
    body: Option<web::Json<ReportRequest>>,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let output_dir = PathBuf::from(&config.storage.output_dir);

    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    let folder = match request.session_folder {
        Some(name) => {
            let folder = output_dir.join(&name);
            if !folder.is_dir() {
                return Err(AppError::NotFound(format!("Session folder {}", name)));
            }
            folder
        }
        None => latest_session_folder(&output_dir)?,
    };

    info!("Generating report for {:?}", folder);
    let composer = ReportComposer::new(
        client.get_ref().clone(),
        config.report.chunk_size,
        config.backend.max_tokens,
    );
    let report = composer.compose(&folder).await;
    state.record_report();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session_folder": folder.file_name().and_then(|n| n.to_str()),
        "report": report
    })))
}

/// The most recently modified `procedure_*` folder.
fn latest_session_folder(output_dir: &std::path::Path) -> Result<PathBuf, AppError> {
    let mut folders: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(output_dir)
        .map_err(|_| AppError::NotFound("No session folders exist yet".to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.path().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with("procedure_"))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    folders.sort_by_key(|(modified, _)| *modified);
    folders
        .pop()
        .map(|(_, path)| path)
        .ok_or_else(|| AppError::NotFound("No session folders exist yet".to_string()))
}
