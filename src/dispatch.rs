//! # Dispatcher
//!
//! The single serialized dispatch path for a session. Every utterance,
//! whether typed or recognized, goes through the same pipeline: route,
//! hand to the selected capability, update the timeline, return the reply.
//! A per-session async lock keeps timeline mutation and report generation
//! strictly ordered even when utterances arrive concurrently.

use crate::agents::annotation::AnnotationLoop;
use crate::agents::chat::ChatAgent;
use crate::agents::notetaker::NoteTaker;
use crate::agents::report::ReportComposer;
use crate::agents::router::{AgentRouter, RouteOutcome};
use crate::agents::Capability;
use crate::session::ProcedureSession;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Reply handed back to the transport layer, carrying the tags that shape
/// the outbound JSON message.
#[derive(Debug, Clone)]
pub struct DispatchReply {
    pub text: String,
    pub is_note: bool,
    pub is_summary: bool,
}

pub struct Dispatcher {
    router: AgentRouter,
    chat: ChatAgent,
    notetaker: NoteTaker,
    composer: ReportComposer,
    session: Arc<ProcedureSession>,
    state: AppState,
    /// Serializes the whole pipeline per session
    lock: Mutex<()>,
    /// Taken and joined when the report capability is selected
    annotation_loop: Mutex<Option<AnnotationLoop>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: AgentRouter,
        chat: ChatAgent,
        notetaker: NoteTaker,
        composer: ReportComposer,
        session: Arc<ProcedureSession>,
        state: AppState,
        annotation_loop: Option<AnnotationLoop>,
    ) -> Self {
        Self {
            router,
            chat,
            notetaker,
            composer,
            session,
            state,
            lock: Mutex::new(()),
            annotation_loop: Mutex::new(annotation_loop),
        }
    }

    pub fn session(&self) -> &Arc<ProcedureSession> {
        &self.session
    }

    /// Dispatch one utterance. `frame_data` is the frame that arrived on the
    /// same message, if any. Returns `None` when the utterance was dropped
    /// (unresolved route or capability failure).
    pub async fn dispatch(
        &self,
        utterance: &str,
        frame_data: Option<String>,
    ) -> Option<DispatchReply> {
        let _guard = self.lock.lock().await;

        if !self.session.is_open() {
            return Some(DispatchReply {
                text: "The procedure has ended and its report was generated.".to_string(),
                is_note: false,
                is_summary: false,
            });
        }

        let history = {
            let timeline = self.session.timeline.lock().unwrap();
            AgentRouter::history_snapshot(&timeline)
        };

        let (capability, corrected) = match self.router.route(utterance, &history).await {
            RouteOutcome::Routed {
                capability,
                corrected_text,
            } => (capability, corrected_text),
            RouteOutcome::Unresolved => {
                warn!("Utterance dropped, no capability resolved: {}", utterance);
                self.state.record_routing_failure();
                return None;
            }
        };

        // Freshest frame wins: the one on the message, else the queue, else
        // the cached last frame.
        let frame = frame_data.or_else(|| self.session.freshest_frame());

        let reply = match capability {
            Capability::Chat => {
                match self.chat.respond(&corrected, &history, frame.as_deref()).await {
                    Ok(reply) => DispatchReply {
                        text: reply.text,
                        is_note: false,
                        is_summary: false,
                    },
                    Err(e) => {
                        warn!("Chat capability failed: {}", e);
                        return None;
                    }
                }
            }
            Capability::NoteTaker => match self.notetaker.record_note(&corrected, frame.as_deref())
            {
                Ok(reply) => {
                    self.state.record_note();
                    DispatchReply {
                        text: reply.text,
                        is_note: true,
                        is_summary: false,
                    }
                }
                Err(e) => {
                    warn!("Note capability failed: {}", e);
                    return None;
                }
            },
            Capability::Report => self.finish_procedure().await,
        };

        {
            let mut timeline = self.session.timeline.lock().unwrap();
            timeline.add_user_message(&corrected);
            timeline.add_agent_message(&reply.text);
        }
        self.state.record_dispatch();

        Some(reply)
    }

    /// Terminal path: stop and join the annotation loop, close the session,
    /// compose the report exactly once.
    async fn finish_procedure(&self) -> DispatchReply {
        if let Some(annotation_loop) = self.annotation_loop.lock().await.take() {
            info!("Stopping annotation loop before report composition");
            annotation_loop.stop().await;
        }
        self.session.close();

        let report = self.composer.compose(self.session.folder()).await;
        self.state.record_report();

        let rendered = serde_json::to_string_pretty(&report)
            .unwrap_or_else(|_| "Report generated.".to_string());
        DispatchReply {
            text: format!("Post-operative report generated.\n{}", rendered),
            is_note: false,
            is_summary: false,
        }
    }

    /// Summary requests skip the router entirely: the chat agent produces a
    /// structured summary from the client-provided records.
    pub async fn summarize(
        &self,
        annotations: Vec<serde_json::Value>,
        notes: Vec<serde_json::Value>,
    ) -> Option<DispatchReply> {
        let _guard = self.lock.lock().await;
        match self.chat.summarize(&annotations, &notes).await {
            Ok(reply) => Some(DispatchReply {
                text: reply.text,
                is_note: false,
                is_summary: true,
            }),
            Err(e) => {
                warn!("Summary request failed: {}", e);
                None
            }
        }
    }
}
