//! # Annotation Loop
//!
//! Background producer/consumer that turns sampled video frames into
//! structured scene annotations. This is the part of the system most exposed
//! to backend flakiness, so failure containment lives here:
//!
//! - transient backend errors are retried a bounded number of times;
//! - unparseable replies go through embedded-JSON extraction, then a
//!   deterministic fallback annotation so the log never has gaps;
//! - a run of consecutive errors triggers one extended cooldown per
//!   threshold crossing instead of hammering a struggling backend.
//!
//! The loop is stopped cooperatively (watch channel) and joined before the
//! report composer may read the annotation log.

use crate::completion::{CompletionClient, CompletionOptions};
use crate::config::AnnotationConfig;
use crate::session::ProcedureSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are an expert surgical scene analyst. Given \
an endoscopic image, identify the current procedure phase, the visible \
instruments, and the visible anatomy. Respond with JSON only.";

/// One structured observation of the surgical scene. Append-only once
/// recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneAnnotation {
    pub timestamp: String,
    pub elapsed_seconds: f64,
    pub tools: Vec<String>,
    pub anatomy: Vec<String>,
    pub phase: String,
    pub description: String,
}

/// Fields the completion backend is asked to produce; timing fields are
/// filled in locally.
#[derive(Debug, Deserialize)]
struct SceneObservation {
    tools: Vec<String>,
    anatomy: Vec<String>,
    phase: String,
    description: String,
}

/// What one annotation cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// An annotation (possibly the fallback) was appended
    Annotated,
    /// No usable frame this cycle
    Skipped,
    /// The consecutive-error threshold was crossed; sleep the cooldown
    Backoff,
}

/// Notifies the transport layer that a new annotation exists.
pub type AnnotationCallback = Box<dyn Fn(&SceneAnnotation) + Send + Sync>;

/// The per-session annotation worker. Owns its mutable cycle state; the
/// surrounding [`AnnotationLoop`] drives it from a spawned task.
pub struct AnnotationWorker {
    client: Arc<dyn CompletionClient>,
    session: Arc<ProcedureSession>,
    settings: AnnotationConfig,
    consecutive_errors: u32,
    callback: Option<AnnotationCallback>,
}

impl AnnotationWorker {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        session: Arc<ProcedureSession>,
        settings: AnnotationConfig,
    ) -> Self {
        Self {
            client,
            session,
            settings,
            consecutive_errors: 0,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: AnnotationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn annotation_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tools": {"type": "array", "items": {"type": "string"}},
                "anatomy": {"type": "array", "items": {"type": "string"}},
                "phase": {"type": "string"},
                "description": {"type": "string"}
            },
            "required": ["tools", "anatomy", "phase", "description"]
        })
    }

    /// Run one cycle: pop a frame, annotate it, append the result.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let frame = match self.session.frame_queue.pop() {
            Some(frame) if frame.len() >= self.settings.min_frame_bytes => frame,
            Some(frame) => {
                debug!("Frame below minimum size ({} bytes), skipping", frame.len());
                return CycleOutcome::Skipped;
            }
            None => return CycleOutcome::Skipped,
        };

        let annotation = match self.annotate_frame(&frame).await {
            Ok(annotation) => {
                self.consecutive_errors = 0;
                annotation
            }
            Err(e) => {
                self.consecutive_errors += 1;
                warn!(
                    "Annotation failed ({} consecutive): {}",
                    self.consecutive_errors, e
                );
                self.fallback_annotation()
            }
        };

        if let Err(e) = self.session.annotation_log().append(&annotation) {
            warn!("Could not append annotation: {}", e);
        } else if let Some(callback) = &self.callback {
            // The callback belongs to the transport layer; a panic or error
            // there must not take down the loop.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&annotation)
            }));
            if result.is_err() {
                warn!("Annotation callback panicked; continuing");
            }
        }

        if self.consecutive_errors >= self.settings.max_consecutive_errors {
            warn!(
                "{} consecutive annotation errors, entering cooldown",
                self.consecutive_errors
            );
            self.consecutive_errors = 0;
            return CycleOutcome::Backoff;
        }

        CycleOutcome::Annotated
    }

    /// Annotate one frame with bounded retries, embedded-JSON recovery on
    /// parse failure.
    async fn annotate_frame(&self, frame: &str) -> crate::error::AppResult<SceneAnnotation> {
        let opts = CompletionOptions {
            temperature: 0.3,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            schema: Some(Self::annotation_schema()),
            ..Default::default()
        };
        let prompt = "Annotate the current endoscopic view.";

        let mut last_error = None;
        for attempt in 0..=self.settings.max_retries {
            match self.client.complete_with_image(prompt, frame, &opts).await {
                Ok(raw) => return Ok(self.parse_observation(&raw)),
                Err(e) => {
                    debug!("Annotation attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| crate::error::AppError::Backend("no attempts made".to_string())))
    }

    /// Parse the backend reply, falling back to embedded `{...}` extraction
    /// and finally the deterministic fallback annotation. Parse failure is
    /// not an error: the loop keeps its cadence.
    fn parse_observation(&self, raw: &str) -> SceneAnnotation {
        if let Ok(obs) = serde_json::from_str::<SceneObservation>(raw.trim()) {
            return self.build_annotation(obs);
        }

        // Models sometimes wrap the JSON in prose; try the embedded object.
        if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
            if start < end {
                if let Ok(obs) = serde_json::from_str::<SceneObservation>(&raw[start..=end]) {
                    debug!("Recovered annotation from embedded JSON");
                    return self.build_annotation(obs);
                }
            }
        }

        warn!("Annotation reply unparseable, using fallback: {}", raw);
        self.fallback_annotation()
    }

    fn build_annotation(&self, obs: SceneObservation) -> SceneAnnotation {
        SceneAnnotation {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            elapsed_seconds: self.session.elapsed_seconds(),
            tools: obs.tools,
            anatomy: obs.anatomy,
            phase: obs.phase,
            description: obs.description,
        }
    }

    fn fallback_annotation(&self) -> SceneAnnotation {
        SceneAnnotation {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            elapsed_seconds: self.session.elapsed_seconds(),
            tools: vec!["none".to_string()],
            anatomy: vec!["none".to_string()],
            phase: "preparation".to_string(),
            description: "Scene could not be analyzed for this interval.".to_string(),
        }
    }

    /// Drive cycles until the stop signal flips.
    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!("Annotation loop started");
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let outcome = self.run_cycle().await;
            let sleep_for = match outcome {
                CycleOutcome::Backoff => Duration::from_secs(self.settings.cooldown_seconds),
                _ => Duration::from_secs(self.settings.time_step_seconds),
            };

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("Annotation loop stopped");
    }
}

/// Handle to a running annotation loop.
pub struct AnnotationLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AnnotationLoop {
    pub fn spawn(worker: AnnotationWorker) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(stop_rx));
        Self { stop_tx, handle }
    }

    /// Signal the loop to stop and wait for the current cycle to finish.
    /// Report composition must not start before this returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::MockCompletionClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> AnnotationConfig {
        AnnotationConfig {
            time_step_seconds: 0,
            min_frame_bytes: 10,
            max_retries: 2,
            max_consecutive_errors: 5,
            cooldown_seconds: 0,
            frame_queue_capacity: 32,
        }
    }

    fn session() -> (tempfile::TempDir, Arc<ProcedureSession>) {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ProcedureSession::create(dir.path(), 32).unwrap());
        (dir, session)
    }

    fn valid_reply() -> &'static str {
        r#"{"tools": ["grasper"], "anatomy": ["gallbladder"], "phase": "dissection", "description": "Grasper retracting the gallbladder."}"#
    }

    #[tokio::test]
    async fn test_empty_queue_cycles_make_no_calls() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always(valid_reply()));
        let mut worker = AnnotationWorker::new(client.clone(), session.clone(), settings());

        for _ in 0..5 {
            assert_eq!(worker.run_cycle().await, CycleOutcome::Skipped);
        }

        assert_eq!(client.total_calls(), 0);
        assert!(session.annotation_log().is_empty());
    }

    #[tokio::test]
    async fn test_valid_frame_appends_annotation() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always(valid_reply()));
        let mut worker = AnnotationWorker::new(client.clone(), session.clone(), settings());

        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);

        let annotations: Vec<SceneAnnotation> = session.annotation_log().read_all();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].phase, "dissection");
        assert_eq!(annotations[0].tools, vec!["grasper"]);
        assert_eq!(client.image_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_frame_is_skipped() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always(valid_reply()));
        let mut worker = AnnotationWorker::new(client.clone(), session.clone(), settings());

        session.frame_queue.push("tiny".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Skipped);
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_reply_uses_fallback() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always("not json at all"));
        let mut worker = AnnotationWorker::new(client, session.clone(), settings());

        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);

        let annotations: Vec<SceneAnnotation> = session.annotation_log().read_all();
        assert_eq!(annotations[0].phase, "preparation");
        assert_eq!(annotations[0].tools, vec!["none"]);
        assert_eq!(annotations[0].anatomy, vec!["none"]);
    }

    #[tokio::test]
    async fn test_embedded_json_is_recovered() {
        let (_dir, session) = session();
        let wrapped = format!("Here is the annotation: {} Hope that helps!", valid_reply());
        let client = Arc::new(MockCompletionClient::always(&wrapped));
        let mut worker = AnnotationWorker::new(client, session.clone(), settings());

        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        worker.run_cycle().await;

        let annotations: Vec<SceneAnnotation> = session.annotation_log().read_all();
        assert_eq!(annotations[0].phase, "dissection");
    }

    #[tokio::test]
    async fn test_backend_failure_retries_then_falls_back() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always_failing("connection refused"));
        let mut worker = AnnotationWorker::new(client.clone(), session.clone(), settings());

        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);

        // Initial attempt plus two retries
        assert_eq!(client.image_calls.load(Ordering::SeqCst), 3);
        let annotations: Vec<SceneAnnotation> = session.annotation_log().read_all();
        assert_eq!(annotations[0].phase, "preparation");
    }

    #[tokio::test]
    async fn test_backoff_once_per_threshold_crossing() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always_failing("connection refused"));
        let mut worker = AnnotationWorker::new(client, session.clone(), settings());

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
            outcomes.push(worker.run_cycle().await);
        }

        let backoffs: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == CycleOutcome::Backoff)
            .map(|(i, _)| i)
            .collect();
        // Threshold is 5: cooldown exactly on the 5th and 10th errored cycle
        assert_eq!(backoffs, vec![4, 9]);
    }

    #[tokio::test]
    async fn test_success_resets_error_counter() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::new(vec![
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Ok(valid_reply().to_string()),
        ]));
        let mut worker = AnnotationWorker::new(client, session.clone(), settings());

        // Four errored cycles (3 attempts each = 12 failures), then a success
        for _ in 0..4 {
            session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
            assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);
        }
        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);
        assert_eq!(worker.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_callback_panic_is_contained() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always(valid_reply()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        let mut worker = AnnotationWorker::new(client, session.clone(), settings())
            .with_callback(Box::new(move |_| {
                calls_in_cb.fetch_add(1, Ordering::SeqCst);
                panic!("transport layer went away");
            }));

        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Loop still works after the panic
        session.record_frame("data:image/jpeg;base64,AAAAAAAAAAAAAAAA".to_string());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Annotated);
        assert_eq!(session.annotation_log().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_joins_loop() {
        let (_dir, session) = session();
        let client = Arc::new(MockCompletionClient::always(valid_reply()));
        let mut cfg = settings();
        cfg.time_step_seconds = 3600; // the stop signal must interrupt the sleep
        let worker = AnnotationWorker::new(client, session, cfg);

        let handle = AnnotationLoop::spawn(worker);
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop() should return promptly");
    }
}
