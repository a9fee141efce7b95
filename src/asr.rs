//! # ASR Relay
//!
//! TCP client for the external speech-recognition backend. The protocol is
//! deliberately minimal: open a connection, stream the raw audio bytes,
//! shut down the write side, then read back one line of the form
//! `"<start> <end> <text>"`.
//!
//! The backend accepts one utterance per connection, so the relay connects
//! per use. Failures are contained with a widening reconnect delay: each
//! consecutive failure doubles the wait before the next attempt, and any
//! success resets it. An ASR outage degrades voice input only; it is never
//! fatal to the session.

use crate::config::AsrConfig;
use crate::error::{AppError, AppResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_RECONNECT_DELAY_SECS: u64 = 60;

pub struct AsrRelay {
    address: String,
    read_timeout: Duration,
    base_delay_secs: u64,
    /// Wait before the next connect after a failure; doubles per failure
    next_delay_secs: Mutex<u64>,
}

impl AsrRelay {
    pub fn new(config: &AsrConfig) -> Self {
        Self {
            address: format!("{}:{}", config.host, config.port),
            read_timeout: Duration::from_secs(config.read_timeout_seconds),
            base_delay_secs: config.reconnect_delay_seconds,
            next_delay_secs: Mutex::new(0),
        }
    }

    /// Startup reachability probe. Logged only; the relay self-heals.
    pub async fn probe(&self) {
        match TcpStream::connect(&self.address).await {
            Ok(_) => info!("ASR backend reachable at {}", self.address),
            Err(e) => warn!(
                "ASR backend not reachable at {} ({}); voice input degraded until it returns",
                self.address, e
            ),
        }
    }

    /// Send one audio buffer and return the recognized text, `None` when
    /// the recognizer produced no words.
    pub async fn transcribe(&self, audio: &[u8]) -> AppResult<Option<String>> {
        if audio.is_empty() {
            return Ok(None);
        }

        self.wait_reconnect_delay().await;

        let mut stream = match TcpStream::connect(&self.address).await {
            Ok(stream) => stream,
            Err(e) => {
                self.record_failure().await;
                return Err(AppError::Transport(format!(
                    "ASR connect to {} failed: {}",
                    self.address, e
                )));
            }
        };

        let result = self.exchange(&mut stream, audio).await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        audio: &[u8],
    ) -> AppResult<Option<String>> {
        stream
            .write_all(audio)
            .await
            .map_err(|e| AppError::Transport(format!("ASR write failed: {}", e)))?;
        // Half-close signals end of utterance; the server replies then closes.
        stream
            .shutdown()
            .await
            .map_err(|e| AppError::Transport(format!("ASR shutdown failed: {}", e)))?;

        let mut response = String::new();
        tokio::time::timeout(self.read_timeout, stream.read_to_string(&mut response))
            .await
            .map_err(|_| AppError::Transport("ASR read timed out".to_string()))?
            .map_err(|e| AppError::Transport(format!("ASR read failed: {}", e)))?;

        debug!("ASR response: {:?}", response);
        Ok(parse_transcript(&response))
    }

    async fn wait_reconnect_delay(&self) {
        let delay = *self.next_delay_secs.lock().await;
        if delay > 0 {
            debug!("Waiting {}s before ASR reconnect", delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    async fn record_success(&self) {
        *self.next_delay_secs.lock().await = 0;
    }

    async fn record_failure(&self) {
        let mut delay = self.next_delay_secs.lock().await;
        *delay = if *delay == 0 {
            self.base_delay_secs
        } else {
            (*delay * 2).min(MAX_RECONNECT_DELAY_SECS)
        };
        warn!("ASR failure; next reconnect delayed {}s", *delay);
    }
}

/// Pick the transcript out of the server's line protocol. Each result line
/// is `"<start> <end> <text>"`; the recognizer may emit several incremental
/// result lines per utterance, and the last non-empty one is the final
/// hypothesis.
fn parse_transcript(response: &str) -> Option<String> {
    let mut transcript = None;
    for line in response.lines() {
        let mut parts = line.splitn(3, ' ');
        let (Some(start), Some(end)) = (parts.next(), parts.next()) else {
            continue;
        };
        if start.parse::<f64>().is_err() || end.parse::<f64>().is_err() {
            continue;
        }
        let text = parts.next().unwrap_or("").trim();
        if !text.is_empty() {
            transcript = Some(text.to_string());
        }
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcript_line() {
        assert_eq!(
            parse_transcript("0 0 take a note of the bleeding\n"),
            Some("take a note of the bleeding".to_string())
        );
        assert_eq!(
            parse_transcript("0.0 2.5 what phase is this"),
            Some("what phase is this".to_string())
        );
    }

    #[test]
    fn test_parse_empty_text_is_none() {
        assert_eq!(parse_transcript("0 0 \n"), None);
        assert_eq!(parse_transcript("0 0"), None);
        assert_eq!(parse_transcript(""), None);
    }

    #[test]
    fn test_parse_keeps_last_incremental_result() {
        assert_eq!(
            parse_transcript("0 0 take a\n0 0 take a note\n0 0 take a note of the bleeding\n"),
            Some("take a note of the bleeding".to_string())
        );
        // A trailing empty result keeps the last non-empty hypothesis
        assert_eq!(
            parse_transcript("0 1.5 clip applied\n0 0 \n"),
            Some("clip applied".to_string())
        );
    }

    #[test]
    fn test_parse_skips_non_result_lines() {
        assert_eq!(
            parse_transcript("ready\n0 1.5 clip applied\n"),
            Some("clip applied".to_string())
        );
        assert_eq!(parse_transcript("status ok\n"), None);
    }

    #[tokio::test]
    async fn test_empty_audio_makes_no_connection() {
        let relay = AsrRelay::new(&AsrConfig {
            host: "127.0.0.1".to_string(),
            // Port 9 is discard; nothing should connect to it anyway
            port: 9,
            read_timeout_seconds: 1,
            reconnect_delay_seconds: 5,
        });
        assert_eq!(relay.transcribe(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_relay_round_trip_with_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            socket.read_to_end(&mut buffer).await.unwrap();
            assert_eq!(buffer, b"audio bytes");
            socket.write_all(b"0 1.2 hello surgeon\n").await.unwrap();
        });

        let relay = AsrRelay::new(&AsrConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            read_timeout_seconds: 5,
            reconnect_delay_seconds: 1,
        });

        let text = relay.transcribe(b"audio bytes").await.unwrap();
        assert_eq!(text, Some("hello surgeon".to_string()));
    }

    #[tokio::test]
    async fn test_failure_widens_reconnect_delay() {
        let relay = AsrRelay::new(&AsrConfig {
            host: "127.0.0.1".to_string(),
            // Bind-then-drop gives a port with nothing listening
            port: {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().port()
            },
            read_timeout_seconds: 1,
            reconnect_delay_seconds: 5,
        });

        assert!(relay.transcribe(b"audio").await.is_err());
        assert_eq!(*relay.next_delay_secs.lock().await, 5);

        // Consecutive failures double the delay up to the cap
        relay.record_failure().await;
        assert_eq!(*relay.next_delay_secs.lock().await, 10);
        relay.record_failure().await;
        assert_eq!(*relay.next_delay_secs.lock().await, 20);

        // A success resets it
        relay.record_success().await;
        assert_eq!(*relay.next_delay_secs.lock().await, 0);
    }
}
