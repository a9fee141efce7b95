//! Text-to-speech proxy. Keeps the TTS API key server-side: the client posts
//! text, the server calls the ElevenLabs-style API and hands back the audio
//! as base64.

use crate::error::AppError;
use actix_web::{web, HttpResponse};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const DEFAULT_VOICE_ID: &str = "TX3LPaxmHKxFdv7VOQHJ";
const TTS_MODEL: &str = "eleven_multilingual_v2";
const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice_id: Option<String>,
}

pub async fn synthesize_speech(body: web::Json<TtsRequest>) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::BadRequest("TTS text cannot be empty".to_string()));
    }

    let api_key = std::env::var("ELEVENLABS_API_KEY")
        .map_err(|_| AppError::ConfigError("ELEVENLABS_API_KEY not set".to_string()))?;
    let voice_id = request.voice_id.as_deref().unwrap_or(DEFAULT_VOICE_ID);

    debug!("TTS request for {} characters", request.text.len());
    let response = reqwest::Client::new()
        .post(format!("{}/{}", API_BASE, voice_id))
        .header("xi-api-key", api_key)
        .json(&json!({
            "text": request.text,
            "model_id": TTS_MODEL,
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        warn!("TTS API returned {}: {}", status, detail);
        return Err(AppError::Backend(format!("TTS API returned {}", status)));
    }

    let audio = response.bytes().await?;
    Ok(HttpResponse::Ok().json(json!({
        "audio_base64": base64::engine::general_purpose::STANDARD.encode(&audio),
        "content_type": "audio/mpeg"
    })))
}
