//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Built-in defaults
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_BACKEND_LLM_URL, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub annotation: AnnotationConfig,
    pub report: ReportConfig,
    pub asr: AsrConfig,
    pub storage: StorageConfig,
}

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Completion backend settings (OpenAI-compatible chat completions endpoint).
///
/// `max_tokens` is the per-request output budget; the report composer doubles
/// it on its truncation retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub llm_url: String,
    pub model_name: String,
    pub max_tokens: u32,
    /// Seconds to wait for the backend health check at startup before
    /// giving up. Failing this check is the only process-fatal condition.
    pub startup_wait_seconds: u64,
    pub request_timeout_seconds: u64,
}

/// Background annotation loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationConfig {
    /// Seconds between annotation cycles
    pub time_step_seconds: u64,
    /// Minimum data-URI length for a frame to be considered valid
    pub min_frame_bytes: usize,
    /// Retries per cycle on transient backend errors
    pub max_retries: u32,
    /// Consecutive-error threshold that triggers the extended cooldown
    pub max_consecutive_errors: u32,
    /// Extended cooldown sleep after the threshold is crossed
    pub cooldown_seconds: u64,
    /// Bounded frame queue capacity (oldest frames evicted when full)
    pub frame_queue_capacity: usize,
}

/// Report composer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Rendered log lines per chunk-summary call
    pub chunk_size: usize,
}

/// Speech recognition backend (line-oriented TCP server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub host: String,
    pub port: u16,
    /// Bounded read timeout so a dead ASR server never hangs a session
    pub read_timeout_seconds: u64,
    /// Initial reconnect delay; doubles on each consecutive failure
    pub reconnect_delay_seconds: u64,
}

/// Where session folders and uploaded videos are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub output_dir: String,
    pub videos_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8050,
            },
            backend: BackendConfig {
                llm_url: "http://localhost:8000/v1".to_string(),
                model_name: "llama3.2".to_string(),
                max_tokens: 2048,
                startup_wait_seconds: 60,
                request_timeout_seconds: 120,
            },
            annotation: AnnotationConfig {
                time_step_seconds: 10,
                min_frame_bytes: 1000,
                max_retries: 2,
                max_consecutive_errors: 5,
                cooldown_seconds: 30,
                frame_queue_capacity: 32,
            },
            report: ReportConfig { chunk_size: 20 },
            asr: AsrConfig {
                host: "localhost".to_string(),
                port: 43001,
                read_timeout_seconds: 10,
                reconnect_delay_seconds: 5,
            },
            storage: StorageConfig {
                output_dir: "procedure_outputs".to_string(),
                videos_dir: "uploaded_videos".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and APP_* environment
    /// variables, with HOST/PORT honored for deployment platforms.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.backend.llm_url.is_empty() {
            return Err(anyhow::anyhow!("Completion backend URL cannot be empty"));
        }

        if self.annotation.time_step_seconds == 0 {
            return Err(anyhow::anyhow!(
                "Annotation time step must be greater than 0"
            ));
        }

        if self.annotation.frame_queue_capacity == 0 {
            return Err(anyhow::anyhow!(
                "Frame queue capacity must be greater than 0"
            ));
        }

        if self.report.chunk_size == 0 {
            return Err(anyhow::anyhow!("Report chunk size must be greater than 0"));
        }

        if self.asr.port == 0 {
            return Err(anyhow::anyhow!("ASR port cannot be 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON string (runtime config endpoint).
    ///
    /// Only the fields present in the JSON are changed; the result is
    /// re-validated before being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(backend) = partial_config.get("backend") {
            if let Some(url) = backend.get("llm_url").and_then(|v| v.as_str()) {
                self.backend.llm_url = url.to_string();
            }
            if let Some(model) = backend.get("model_name").and_then(|v| v.as_str()) {
                self.backend.model_name = model.to_string();
            }
            if let Some(tokens) = backend.get("max_tokens").and_then(|v| v.as_u64()) {
                self.backend.max_tokens = tokens as u32;
            }
        }

        if let Some(annotation) = partial_config.get("annotation") {
            if let Some(step) = annotation.get("time_step_seconds").and_then(|v| v.as_u64()) {
                self.annotation.time_step_seconds = step;
            }
            if let Some(min) = annotation.get("min_frame_bytes").and_then(|v| v.as_u64()) {
                self.annotation.min_frame_bytes = min as usize;
            }
        }

        if let Some(report) = partial_config.get("report") {
            if let Some(chunk) = report.get("chunk_size").and_then(|v| v.as_u64()) {
                self.report.chunk_size = chunk as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8050);
        assert_eq!(config.report.chunk_size, 20);
        assert_eq!(config.annotation.max_consecutive_errors, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.report.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "report": {"chunk_size": 10}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.report.chunk_size, 10);
        // Untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.backend.model_name, "llama3.2");
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"report": {"chunk_size": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
