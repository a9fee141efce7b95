//! # Agent Router
//!
//! Classifies each user utterance into one of the fixed capabilities and
//! corrects its text (ASR output in particular arrives noisy) in a single
//! schema-constrained completion call.
//!
//! ## Contract
//! The router never guesses: a backend failure or a reply that does not
//! match the expected schema yields [`RouteOutcome::Unresolved`], and the
//! caller drops the utterance with a warning instead of dispatching it to
//! the wrong capability.

use crate::agents::Capability;
use crate::completion::{CompletionClient, CompletionOptions};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many timeline entries of context the router sees.
const HISTORY_WINDOW: usize = 6;

const SYSTEM_PROMPT: &str = "You are a routing assistant for a surgical copilot. \
Given the surgeon's latest request and the recent conversation, correct any \
speech-recognition mistakes in the request and select which capability should \
handle it: 'chat' for questions and conversation about the procedure or the \
current view, 'notetaker' for requests to record a note or observation, \
'report' for requests to finish the procedure and produce the post-operative \
report. Respond with JSON only.";

/// Wire shape the completion backend is constrained to.
#[derive(Debug, Deserialize)]
struct RouterDecision {
    corrected_input: String,
    selection: String,
}

/// Outcome of routing one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed {
        capability: Capability,
        corrected_text: String,
    },
    /// Backend failure or schema mismatch; the utterance must be dropped.
    Unresolved,
}

pub struct AgentRouter {
    client: Arc<dyn CompletionClient>,
}

impl AgentRouter {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// JSON schema the backend reply is constrained to (`guided_json`).
    fn decision_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "corrected_input": {"type": "string"},
                "selection": {
                    "type": "string",
                    "enum": ["chat", "notetaker", "report"]
                }
            },
            "required": ["corrected_input", "selection"]
        })
    }

    /// Route one utterance given a rendered snapshot of the recent timeline.
    pub async fn route(&self, utterance: &str, history: &str) -> RouteOutcome {
        let prompt = if history.is_empty() {
            format!("Surgeon's request: {}", utterance)
        } else {
            format!(
                "Recent conversation:\n{}\nSurgeon's request: {}",
                history, utterance
            )
        };

        let opts = CompletionOptions {
            temperature: 0.0,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            schema: Some(Self::decision_schema()),
            ..Default::default()
        };

        let raw = match self.client.complete_text(&prompt, &opts).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Routing call failed: {}", e);
                return RouteOutcome::Unresolved;
            }
        };

        match Self::parse_decision(&raw) {
            Some((capability, corrected_text)) => {
                debug!("Routed utterance to {:?}", capability);
                RouteOutcome::Routed {
                    capability,
                    corrected_text,
                }
            }
            None => {
                warn!("Routing reply did not match schema: {}", raw);
                RouteOutcome::Unresolved
            }
        }
    }

    fn parse_decision(raw: &str) -> Option<(Capability, String)> {
        let decision: RouterDecision = serde_json::from_str(raw.trim()).ok()?;
        let capability = Capability::from_selection(&decision.selection)?;
        Some((capability, decision.corrected_input))
    }

    /// Render the router's view of the timeline.
    pub fn history_snapshot(timeline: &crate::session::SessionTimeline) -> String {
        timeline.render_history(HISTORY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::MockCompletionClient;

    async fn route_with(reply: &str, utterance: &str) -> RouteOutcome {
        let client = Arc::new(MockCompletionClient::always(reply));
        let router = AgentRouter::new(client);
        router.route(utterance, "").await
    }

    #[tokio::test]
    async fn test_routes_valid_decision() {
        let outcome = route_with(
            r#"{"corrected_input": "take a note of the bleeding", "selection": "notetaker"}"#,
            "take a note of the bleeding",
        )
        .await;
        assert_eq!(
            outcome,
            RouteOutcome::Routed {
                capability: Capability::NoteTaker,
                corrected_text: "take a note of the bleeding".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_selection_is_unresolved() {
        let outcome = route_with(
            r#"{"corrected_input": "what phase is this", "selection": "Chat"}"#,
            "what phase is this",
        )
        .await;
        assert_eq!(outcome, RouteOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_unknown_selection_is_unresolved() {
        let outcome = route_with(
            r#"{"corrected_input": "hmm", "selection": "summary"}"#,
            "hmm",
        )
        .await;
        assert_eq!(outcome, RouteOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_missing_field_is_unresolved() {
        let outcome = route_with(r#"{"selection": "chat"}"#, "hello").await;
        assert_eq!(outcome, RouteOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_backend_failure_is_unresolved() {
        let client = Arc::new(MockCompletionClient::always_failing("connection refused"));
        let router = AgentRouter::new(client);
        let outcome = router.route("what do you see", "").await;
        assert_eq!(outcome, RouteOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_non_json_reply_is_unresolved() {
        let outcome = route_with("I think this should go to chat.", "hello").await;
        assert_eq!(outcome, RouteOutcome::Unresolved);
    }
}
