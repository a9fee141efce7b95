//! # Chat Agent
//!
//! Answers the surgeon's questions over the conversation history, with the
//! freshest available video frame attached when one exists so visual
//! questions ("what instrument is this?") get grounded answers.

use crate::agents::AgentReply;
use crate::completion::{CompletionClient, CompletionOptions};
use crate::error::AppResult;
use std::sync::Arc;
use tracing::debug;

/// How many timeline entries of context the chat prompt carries.
const HISTORY_WINDOW: usize = 10;

const SYSTEM_PROMPT: &str = "You are a surgical copilot assisting during a \
live procedure. Answer concisely and factually. When an endoscopic image is \
provided, describe only what is visible in it.";

const IMAGE_HINT: &str = "The current endoscopic view is attached. If the \
question concerns an instrument or anatomy, identify what is visible.";

pub struct ChatAgent {
    client: Arc<dyn CompletionClient>,
}

impl ChatAgent {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Answer an utterance, optionally grounded in a frame.
    pub async fn respond(
        &self,
        utterance: &str,
        history: &str,
        frame: Option<&str>,
    ) -> AppResult<AgentReply> {
        let mut prompt = String::new();
        if !history.is_empty() {
            prompt.push_str("Recent conversation:\n");
            prompt.push_str(history);
            prompt.push('\n');
        }
        prompt.push_str("Surgeon: ");
        prompt.push_str(utterance);

        let opts = CompletionOptions {
            temperature: 0.3,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            ..Default::default()
        };

        let text = match frame {
            Some(frame) => {
                debug!("Chat request with frame attached");
                prompt.push('\n');
                prompt.push_str(IMAGE_HINT);
                self.client.complete_with_image(&prompt, frame, &opts).await?
            }
            None => self.client.complete_text(&prompt, &opts).await?,
        };

        Ok(AgentReply::new(text))
    }

    /// Build a structured textual summary from client-provided annotation and
    /// note arrays. Bypasses the router; the transport layer tags the reply
    /// as a summary response.
    pub async fn summarize(
        &self,
        annotations: &[serde_json::Value],
        notes: &[serde_json::Value],
    ) -> AppResult<AgentReply> {
        let mut prompt = String::from(
            "Summarize the procedure so far for the surgeon. Cover the phases \
             seen, instruments used, anatomy involved, and any recorded notes. \
             Be brief and structured.\n\nScene annotations:\n",
        );
        if annotations.is_empty() {
            prompt.push_str("(none)\n");
        }
        for a in annotations {
            prompt.push_str(&a.to_string());
            prompt.push('\n');
        }
        prompt.push_str("\nOperator notes:\n");
        if notes.is_empty() {
            prompt.push_str("(none)\n");
        }
        for n in notes {
            prompt.push_str(&n.to_string());
            prompt.push('\n');
        }

        let opts = CompletionOptions {
            temperature: 0.3,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            ..Default::default()
        };

        let text = self.client.complete_text(&prompt, &opts).await?;
        Ok(AgentReply::new(text))
    }

    pub fn history_window() -> usize {
        HISTORY_WINDOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::MockCompletionClient;

    #[tokio::test]
    async fn test_text_only_question_uses_text_call() {
        let client = Arc::new(MockCompletionClient::always("The dissection phase."));
        let agent = ChatAgent::new(client.clone());

        let reply = agent
            .respond("what phase are we in", "", None)
            .await
            .unwrap();

        assert_eq!(reply.text, "The dissection phase.");
        assert!(!reply.is_note);
        assert_eq!(client.text_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(client.image_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_frame_attaches_image_call() {
        let client = Arc::new(MockCompletionClient::always("A grasper."));
        let agent = ChatAgent::new(client.clone());

        let reply = agent
            .respond(
                "what instrument is this",
                "User: hello\nAssistant: hi\n",
                Some("data:image/jpeg;base64,abc"),
            )
            .await
            .unwrap();

        assert_eq!(reply.text, "A grasper.");
        assert_eq!(client.text_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(client.image_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_summary_is_single_text_call() {
        let client = Arc::new(MockCompletionClient::always("Summary text."));
        let agent = ChatAgent::new(client.clone());

        let annotations = vec![serde_json::json!({"phase": "dissection"})];
        let reply = agent.summarize(&annotations, &[]).await.unwrap();

        assert_eq!(reply.text, "Summary text.");
        assert_eq!(client.total_calls(), 1);
    }
}
