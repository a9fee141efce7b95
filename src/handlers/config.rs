use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "backend": {
                "llm_url": config.backend.llm_url,
                "model_name": config.backend.model_name,
                "max_tokens": config.backend.max_tokens
            },
            "annotation": {
                "time_step_seconds": config.annotation.time_step_seconds,
                "min_frame_bytes": config.annotation.min_frame_bytes,
                "max_retries": config.annotation.max_retries,
                "max_consecutive_errors": config.annotation.max_consecutive_errors,
                "cooldown_seconds": config.annotation.cooldown_seconds
            },
            "report": {
                "chunk_size": config.report.chunk_size
            },
            "asr": {
                "host": config.asr.host,
                "port": config.asr.port,
                "read_timeout_seconds": config.asr.read_timeout_seconds
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ConfigError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port
            },
            "backend": {
                "llm_url": current_config.backend.llm_url,
                "model_name": current_config.backend.model_name,
                "max_tokens": current_config.backend.max_tokens
            },
            "annotation": {
                "time_step_seconds": current_config.annotation.time_step_seconds,
                "min_frame_bytes": current_config.annotation.min_frame_bytes
            },
            "report": {
                "chunk_size": current_config.report.chunk_size
            }
        }
    })))
}
