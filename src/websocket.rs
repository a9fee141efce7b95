//! # WebSocket Transport
//!
//! Two channels multiplex the client connection:
//!
//! 1. **`/ws` duplex session channel**: JSON messages both ways. Inbound
//!    messages are recognized by their keys (`user_input`, `frame_data`,
//!    `auto_frame`, `summary_request`, `type: "heartbeat"`); unknown keys are
//!    ignored and invalid JSON is logged and skipped. Utterances go through
//!    the dispatch pipeline; frames feed the annotation queue.
//! 2. **`/ws/audio` one-shot audio channel**: binary chunks accumulated
//!    until the peer closes, then relayed to the ASR backend in one exchange.
//!    Recognized text is re-injected into the duplex channel as a
//!    `request_frame` event so the client can attach a fresh frame.
//!
//! ## Actor Model
//! Each connection is an independent Actix actor. Slow work (dispatch, ASR)
//! runs in spawned tasks that send results back through the actor's address,
//! so the socket stays responsive to heartbeats throughout.

use crate::agents::annotation::SceneAnnotation;
use crate::asr::AsrRelay;
use crate::dispatch::{DispatchReply, Dispatcher};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ping cadence on the duplex channel.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Close the connection when the client stays silent this long.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound duplex message. The protocol is keyed by field presence, not a
/// type tag, so every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct InboundMessage {
    pub user_input: Option<String>,
    /// Data-URI frame captured with the message
    pub frame_data: Option<String>,
    /// Marks `frame_data` as a periodically sampled frame with no utterance
    /// attached
    pub auto_frame: Option<bool>,
    /// Marks an utterance that came back from the ASR round trip
    pub asr_final: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub summary_request: Option<bool>,
    /// Client-provided records for a summary request
    pub annotations: Option<Vec<serde_json::Value>>,
    pub notes: Option<Vec<serde_json::Value>>,
}

/// Text pushed to a connected duplex client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundText(pub String);

/// Registry of connected duplex clients, shared with the audio channel (for
/// recognized-text re-injection) and the REST layer (for video broadcasts).
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<StdMutex<Vec<Recipient<OutboundText>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, client: Recipient<OutboundText>) {
        self.clients.lock().unwrap().push(client);
    }

    fn unregister(&self, client: &Recipient<OutboundText>) {
        self.clients.lock().unwrap().retain(|c| c != client);
    }

    /// Push a message to every connected duplex client.
    pub fn broadcast(&self, message: String) {
        for client in self.clients.lock().unwrap().iter() {
            client.do_send(OutboundText(message.clone()));
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

/// Outbound message shapes.
pub fn agent_response_message(reply: &DispatchReply) -> String {
    let mut body = json!({ "agent_response": reply.text });
    if reply.is_note {
        body["is_note"] = json!(true);
    }
    if reply.is_summary {
        body["summary_response"] = json!(true);
    }
    body.to_string()
}

/// Rendered for every annotation the background loop records, so connected
/// clients see the annotation stream live.
pub fn annotation_update_message(annotation: &SceneAnnotation) -> String {
    json!({
        "agent_response": format!(
            "Annotation: Phase '{}' | Tools: {} | Anatomy: {}",
            annotation.phase,
            annotation.tools.join(", "),
            annotation.anatomy.join(", ")
        )
    })
    .to_string()
}

pub fn video_updated_message(video_src: &str) -> String {
    json!({ "video_updated": true, "video_src": video_src }).to_string()
}

pub fn recognized_text_message(text: &str) -> String {
    json!({
        "request_frame": true,
        "recognized_text": text,
        "user_input": text,
        "asr_final": true
    })
    .to_string()
}

/// Actor for one duplex session connection.
pub struct SessionSocket {
    connection_id: uuid::Uuid,
    dispatcher: Arc<Dispatcher>,
    state: AppState,
    registry: ClientRegistry,
    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(dispatcher: Arc<Dispatcher>, state: AppState, registry: ClientRegistry) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4(),
            dispatcher,
            state,
            registry,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_inbound(&mut self, message: InboundMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if message.kind.as_deref() == Some("heartbeat") {
            self.last_heartbeat = Instant::now();
            return;
        }

        // Frames always ride in `frame_data`; `auto_frame: true` only marks
        // a sampled frame with no utterance attached. Either way the frame
        // feeds the annotation queue.
        let frame = message.frame_data;
        if let Some(frame) = &frame {
            self.dispatcher.session().record_frame(frame.clone());
        }

        if message.summary_request == Some(true) {
            let dispatcher = self.dispatcher.clone();
            let annotations = message.annotations.unwrap_or_default();
            let notes = message.notes.unwrap_or_default();
            let addr = ctx.address();

            tokio::spawn(async move {
                if let Some(reply) = dispatcher.summarize(annotations, notes).await {
                    addr.do_send(OutboundText(agent_response_message(&reply)));
                }
            });
            return;
        }

        if let Some(utterance) = message.user_input {
            if utterance.trim().is_empty() {
                return;
            }
            if message.asr_final == Some(true) {
                debug!("Dispatching recognized utterance: {}", utterance);
            }

            let dispatcher = self.dispatcher.clone();
            let addr = ctx.address();

            tokio::spawn(async move {
                if let Some(reply) = dispatcher.dispatch(&utterance, frame).await {
                    addr.do_send(OutboundText(agent_response_message(&reply)));
                }
            });
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Session channel {} connected", self.connection_id);
        self.state.increment_active_connections();
        self.registry.register(ctx.address().recipient());

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Session channel {} heartbeat timeout, closing", act.connection_id);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        info!("Session channel {} disconnected", self.connection_id);
        self.state.decrement_active_connections();
        self.registry.unregister(&ctx.address().recipient());
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(message) => self.handle_inbound(message, ctx),
                Err(e) => warn!("Invalid session message skipped: {}", e),
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Unexpected binary frame on session channel, ignoring");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Session channel closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("Session channel protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundText> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Actor for one audio capture. Binary chunks accumulate until the peer
/// closes the socket; the full buffer then makes one ASR round trip.
pub struct AudioSocket {
    relay: Arc<AsrRelay>,
    registry: ClientRegistry,
    buffer: Vec<u8>,
}

impl AudioSocket {
    pub fn new(relay: Arc<AsrRelay>, registry: ClientRegistry) -> Self {
        Self {
            relay,
            registry,
            buffer: Vec::new(),
        }
    }

    /// Forward the accumulated buffer through ASR and re-inject any
    /// recognized text into the duplex channel. An empty capture never
    /// reaches the ASR backend.
    fn finish_capture(&mut self) {
        let audio = std::mem::take(&mut self.buffer);
        if audio.is_empty() {
            debug!("Audio capture closed with no data, skipping ASR");
            return;
        }

        info!("Audio capture complete ({} bytes), relaying to ASR", audio.len());
        let relay = self.relay.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            match relay.transcribe(&audio).await {
                Ok(Some(text)) => {
                    info!("Recognized: {}", text);
                    registry.broadcast(recognized_text_message(&text));
                }
                Ok(None) => debug!("ASR recognized no words"),
                Err(e) => warn!("ASR relay failed for this capture: {}", e),
            }
        });
    }
}

impl Actor for AudioSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!("Audio channel connected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.buffer.extend_from_slice(&data);
            }
            Ok(ws::Message::Text(_)) => {
                debug!("Text frame on audio channel ignored");
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                debug!("Audio channel closed: {:?}", reason);
                self.finish_capture();
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                error!("Audio channel protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

/// `/ws` upgrade handler.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    dispatcher: web::Data<Arc<Dispatcher>>,
    registry: web::Data<ClientRegistry>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "Session channel request from: {:?}",
        req.connection_info().peer_addr()
    );
    let socket = SessionSocket::new(
        dispatcher.get_ref().clone(),
        app_state.get_ref().clone(),
        registry.get_ref().clone(),
    );
    ws::start(socket, &req, stream)
}

/// `/ws/audio` upgrade handler.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    relay: web::Data<Arc<AsrRelay>>,
    registry: web::Data<ClientRegistry>,
) -> ActixResult<HttpResponse> {
    debug!(
        "Audio channel request from: {:?}",
        req.connection_info().peer_addr()
    );
    let socket = AudioSocket::new(relay.get_ref().clone(), registry.get_ref().clone());
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_by_key_presence() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"user_input": "what phase is this"}"#).unwrap();
        assert_eq!(msg.user_input.as_deref(), Some("what phase is this"));
        assert!(msg.frame_data.is_none());
        assert!(msg.summary_request.is_none());

        let msg: InboundMessage = serde_json::from_str(
            r#"{"user_input": "clip applied", "frame_data": "data:image/jpeg;base64,abc", "asr_final": true}"#,
        )
        .unwrap();
        assert_eq!(msg.asr_final, Some(true));
        assert!(msg.frame_data.is_some());
    }

    #[test]
    fn test_sampled_frame_message() {
        // The frame rides in frame_data; auto_frame is only a boolean marker.
        let msg: InboundMessage = serde_json::from_str(
            r#"{"auto_frame": true, "frame_data": "data:image/jpeg;base64,abc"}"#,
        )
        .unwrap();
        assert_eq!(msg.auto_frame, Some(true));
        assert_eq!(msg.frame_data.as_deref(), Some("data:image/jpeg;base64,abc"));
        assert!(msg.user_input.is_none());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"something_new": 1, "summary_request": true}"#).unwrap();
        assert_eq!(msg.summary_request, Some(true));
        assert!(msg.user_input.is_none());
    }

    #[test]
    fn test_heartbeat_message() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type": "heartbeat"}"#).unwrap();
        assert_eq!(msg.kind.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn test_agent_response_shapes() {
        let plain = DispatchReply {
            text: "The dissection phase.".to_string(),
            is_note: false,
            is_summary: false,
        };
        let body: serde_json::Value =
            serde_json::from_str(&agent_response_message(&plain)).unwrap();
        assert_eq!(body["agent_response"], "The dissection phase.");
        assert!(body.get("is_note").is_none());
        assert!(body.get("summary_response").is_none());

        let note = DispatchReply {
            text: "Note 1 recorded".to_string(),
            is_note: true,
            is_summary: false,
        };
        let body: serde_json::Value = serde_json::from_str(&agent_response_message(&note)).unwrap();
        assert_eq!(body["is_note"], true);

        let summary = DispatchReply {
            text: "Summary.".to_string(),
            is_note: false,
            is_summary: true,
        };
        let body: serde_json::Value =
            serde_json::from_str(&agent_response_message(&summary)).unwrap();
        assert_eq!(body["summary_response"], true);
    }

    #[test]
    fn test_annotation_update_message_shape() {
        let annotation = SceneAnnotation {
            timestamp: "2026-08-28 10:00:00".to_string(),
            elapsed_seconds: 42.0,
            tools: vec!["grasper".to_string(), "hook".to_string()],
            anatomy: vec!["gallbladder".to_string()],
            phase: "dissection".to_string(),
            description: "Dissecting the hepatocystic triangle".to_string(),
        };

        let body: serde_json::Value =
            serde_json::from_str(&annotation_update_message(&annotation)).unwrap();
        assert_eq!(
            body["agent_response"],
            "Annotation: Phase 'dissection' | Tools: grasper, hook | Anatomy: gallbladder"
        );
    }

    #[test]
    fn test_recognized_text_message_shape() {
        let body: serde_json::Value =
            serde_json::from_str(&recognized_text_message("take a note")).unwrap();
        assert_eq!(body["request_frame"], true);
        assert_eq!(body["recognized_text"], "take a note");
        assert_eq!(body["user_input"], "take a note");
        assert_eq!(body["asr_final"], true);
    }

    #[test]
    fn test_video_updated_message_shape() {
        let body: serde_json::Value =
            serde_json::from_str(&video_updated_message("/api/v1/videos/case1.mp4")).unwrap();
        assert_eq!(body["video_updated"], true);
        assert_eq!(body["video_src"], "/api/v1/videos/case1.mp4");
    }
}
