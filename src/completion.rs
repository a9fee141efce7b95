//! # Completion Backend Client
//!
//! Abstraction over the generative completion backend plus the HTTP
//! implementation talking to an OpenAI-compatible `/chat/completions`
//! endpoint (vLLM, Ollama, llama.cpp server, ...).
//!
//! ## Serialization Invariant
//! The backend realistically serves one request at a time, so the client is
//! a serializing shared resource: a process-wide mutex is held for the whole
//! duration of every completion call. Callers block on the lock rather than
//! issuing concurrent requests.
//!
//! ## Schema Constraints
//! Requests may carry a JSON-schema constraint (`guided_json`), honored
//! best-effort by the backend. Callers must validate the output regardless;
//! nothing here assumes strict enforcement.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Options applied to a single completion request.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// System prompt prepended to the conversation
    pub system_prompt: Option<String>,
    /// Optional JSON-schema constraint, forwarded as `guided_json`
    pub schema: Option<serde_json::Value>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 2048,
            system_prompt: None,
            schema: None,
        }
    }
}

/// Capability set of the generative backend.
///
/// The single abstraction every agent talks through; swapping the backend
/// (or mocking it in tests) means implementing these two calls.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Text-only completion.
    async fn complete_text(&self, prompt: &str, opts: &CompletionOptions) -> AppResult<String>;

    /// Completion with an attached image (data-URI encoded).
    async fn complete_with_image(
        &self,
        prompt: &str,
        image_data_uri: &str,
        opts: &CompletionOptions,
    ) -> AppResult<String>;
}

/// HTTP client for an OpenAI-compatible completion backend.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    /// Process-wide serialization of backend calls
    lock: Mutex<()>,
}

impl HttpCompletionClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
            model: model.into(),
            lock: Mutex::new(()),
        }
    }

    /// Block until the backend answers its `/models` endpoint, polling once
    /// per second up to `wait` total.
    ///
    /// Called once at startup; failure here is process-fatal by design.
    pub async fn wait_for_backend(&self, wait: Duration) -> AppResult<()> {
        let check_url = format!("{}/models", self.base_url);
        let deadline = tokio::time::Instant::now() + wait;
        let mut attempt = 0u64;

        loop {
            match self.http.get(&check_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Connected to completion backend at {}", self.base_url);
                    return Ok(());
                }
                Ok(resp) => {
                    debug!("Backend health check returned {}", resp.status());
                }
                Err(e) => {
                    // Log every fifth attempt to keep startup output readable
                    if attempt % 5 == 0 {
                        info!("Waiting for completion backend (attempt {}): {}", attempt + 1, e);
                    }
                }
            }

            attempt += 1;
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Backend(format!(
                    "Unable to reach completion backend at {} after {:?}",
                    self.base_url, wait
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn send_request(&self, request: &ChatCompletionRequest) -> AppResult<String> {
        // Held across the whole request: one in-flight call process-wide
        let _guard = self.lock.lock().await;

        let url = format!("{}/chat/completions", self.base_url);
        let response = self.http.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "Backend returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::MalformedOutput(format!("Invalid completion body: {}", e)))?;

        match parsed.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content.unwrap_or_default()),
            None => {
                warn!("Completion backend returned no choices");
                Ok(String::new())
            }
        }
    }

    fn build_request(
        &self,
        prompt: &str,
        image_data_uri: Option<&str>,
        opts: &CompletionOptions,
    ) -> ChatCompletionRequest {
        let mut messages = Vec::new();

        if let Some(system) = &opts.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: vec![MessageContent::Text {
                    text: system.clone(),
                }],
            });
        }

        let mut content = vec![MessageContent::Text {
            text: prompt.to_string(),
        }];
        if let Some(uri) = image_data_uri {
            content.push(MessageContent::ImageUrl {
                image_url: ImageUrl {
                    url: uri.to_string(),
                },
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content,
        });

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            guided_json: opts.schema.clone(),
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete_text(&self, prompt: &str, opts: &CompletionOptions) -> AppResult<String> {
        debug!(
            "Sending text completion (model={}, temperature={})",
            self.model, opts.temperature
        );
        let request = self.build_request(prompt, None, opts);
        self.send_request(&request).await
    }

    async fn complete_with_image(
        &self,
        prompt: &str,
        image_data_uri: &str,
        opts: &CompletionOptions,
    ) -> AppResult<String> {
        debug!(
            "Sending vision completion (model={}, image_len={})",
            self.model,
            image_data_uri.len()
        );
        let request = self.build_request(prompt, Some(image_data_uri), opts);
        self.send_request(&request).await
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    /// vLLM-style guided decoding constraint; ignored by backends that do
    /// not support it
    #[serde(skip_serializing_if = "Option::is_none")]
    guided_json: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<MessageContent>,
}

enum MessageContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl Serialize for MessageContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        match self {
            MessageContent::Text { text } => {
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", text)?;
            }
            MessageContent::ImageUrl { image_url } => {
                map.serialize_entry("type", "image_url")?;
                map.serialize_entry("image_url", image_url)?;
            }
        }
        map.end()
    }
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Scripted backend double shared by the agent and composer tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// CompletionClient that pops pre-scripted responses and counts calls.
    ///
    /// When the script runs out it keeps returning the last configured
    /// response (or an error if the script was empty).
    pub struct MockCompletionClient {
        responses: StdMutex<VecDeque<Result<String, String>>>,
        last: StdMutex<Option<Result<String, String>>>,
        pub text_calls: AtomicUsize,
        pub image_calls: AtomicUsize,
    }

    impl MockCompletionClient {
        pub fn new(script: Vec<Result<String, String>>) -> Self {
            Self {
                responses: StdMutex::new(script.into_iter().collect()),
                last: StdMutex::new(None),
                text_calls: AtomicUsize::new(0),
                image_calls: AtomicUsize::new(0),
            }
        }

        pub fn always(response: &str) -> Self {
            let mut mock = Self::new(vec![]);
            *mock.last.get_mut().unwrap() = Some(Ok(response.to_string()));
            mock
        }

        pub fn always_failing(message: &str) -> Self {
            let mut mock = Self::new(vec![]);
            *mock.last.get_mut().unwrap() = Some(Err(message.to_string()));
            mock
        }

        pub fn total_calls(&self) -> usize {
            self.text_calls.load(Ordering::SeqCst) + self.image_calls.load(Ordering::SeqCst)
        }

        fn next_response(&self) -> AppResult<String> {
            let mut responses = self.responses.lock().unwrap();
            let next = match responses.pop_front() {
                Some(r) => {
                    *self.last.lock().unwrap() = Some(r.clone());
                    r
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or(Err("mock script exhausted".to_string())),
            };
            next.map_err(AppError::Backend)
        }
    }

    #[async_trait]
    impl CompletionClient for MockCompletionClient {
        async fn complete_text(
            &self,
            _prompt: &str,
            _opts: &CompletionOptions,
        ) -> AppResult<String> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            self.next_response()
        }

        async fn complete_with_image(
            &self,
            _prompt: &str,
            _image_data_uri: &str,
            _opts: &CompletionOptions,
        ) -> AppResult<String> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            self.next_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let client = HttpCompletionClient::new(
            "http://localhost:8000/v1",
            "llama3.2",
            Duration::from_secs(5),
        );
        let opts = CompletionOptions {
            temperature: 0.3,
            max_tokens: 512,
            system_prompt: Some("You are a surgical assistant.".to_string()),
            schema: Some(serde_json::json!({"type": "object"})),
        };
        let request = client.build_request("hello", Some("data:image/jpeg;base64,abc"), &opts);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"][0]["type"], "text");
        assert_eq!(json["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,abc"
        );
        assert_eq!(json["guided_json"]["type"], "object");
    }

    #[test]
    fn test_guided_json_omitted_when_unset() {
        let client = HttpCompletionClient::new(
            "http://localhost:8000/v1",
            "llama3.2",
            Duration::from_secs(5),
        );
        let request = client.build_request("hi", None, &CompletionOptions::default());
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("guided_json").is_none());
    }
}
