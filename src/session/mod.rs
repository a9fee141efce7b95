//! # Procedure Session
//!
//! Groups everything belonging to one live procedure: the conversation
//! timeline, the append-only annotation and note logs, the bounded frame
//! queue fed by the transport layer, and the on-disk session folder.
//!
//! ## Lifecycle
//! Created at session start; the annotation loop runs while the session is
//! open. Selecting the report capability closes the session (annotation loop
//! stopped and joined first), after which the logs are read-only inputs for
//! the report composer.

pub mod log;
pub mod timeline;

pub use log::JsonArrayLog;
pub use timeline::SessionTimeline;

use crate::error::AppResult;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

/// File names inside a session folder.
pub const ANNOTATION_FILE: &str = "annotation.json";
pub const NOTES_FILE: &str = "notetaker_notes.json";
pub const REPORT_FILE: &str = "post_op_note.json";
pub const NOTE_IMAGES_DIR: &str = "note_images";

/// Bounded, thread-safe FIFO of data-URI frames.
///
/// Producers never block: at capacity the oldest frame is evicted. The
/// consumer never blocks either; an empty queue is a normal, frequent
/// condition.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest one at capacity.
    pub fn push(&self, frame: String) {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Non-blocking pop of the oldest frame.
    pub fn pop(&self) -> Option<String> {
        self.frames.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }
}

/// State for one live procedure session.
pub struct ProcedureSession {
    /// Unique session folder, e.g. `procedure_2025_03_14__09_26_53`
    folder: PathBuf,

    /// Monotonic start time used for elapsed-seconds annotations
    started_at: Instant,

    /// Conversation log, mutated only from the dispatch path
    pub timeline: Mutex<SessionTimeline>,

    annotation_log: JsonArrayLog,
    note_log: JsonArrayLog,

    /// Frames sampled opportunistically from the duplex channel
    pub frame_queue: FrameQueue,

    /// Most recent frame seen, kept to service follow-up questions that
    /// arrive without a fresh frame
    last_frame: Mutex<Option<String>>,

    open: AtomicBool,
}

impl ProcedureSession {
    /// Create the session folder (including the note image subfolder) and
    /// return the new session.
    pub fn create(output_dir: &Path, frame_queue_capacity: usize) -> AppResult<Self> {
        let start_str = chrono::Local::now().format("%Y_%m_%d__%H_%M_%S");
        let folder = output_dir.join(format!("procedure_{}", start_str));
        std::fs::create_dir_all(folder.join(NOTE_IMAGES_DIR))?;

        info!("Procedure session folder created: {:?}", folder);

        Ok(Self {
            annotation_log: JsonArrayLog::new(folder.join(ANNOTATION_FILE)),
            note_log: JsonArrayLog::new(folder.join(NOTES_FILE)),
            folder,
            started_at: Instant::now(),
            timeline: Mutex::new(SessionTimeline::new()),
            frame_queue: FrameQueue::new(frame_queue_capacity),
            last_frame: Mutex::new(None),
            open: AtomicBool::new(true),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn annotation_log(&self) -> &JsonArrayLog {
        &self.annotation_log
    }

    pub fn note_log(&self) -> &JsonArrayLog {
        &self.note_log
    }

    pub fn note_images_dir(&self) -> PathBuf {
        self.folder.join(NOTE_IMAGES_DIR)
    }

    pub fn report_path(&self) -> PathBuf {
        self.folder.join(REPORT_FILE)
    }

    /// Seconds since the session opened.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Record a frame: queued for the annotation loop and cached as the
    /// last-known frame.
    pub fn record_frame(&self, frame: String) {
        *self.last_frame.lock().unwrap() = Some(frame.clone());
        self.frame_queue.push(frame);
    }

    pub fn last_frame(&self) -> Option<String> {
        self.last_frame.lock().unwrap().clone()
    }

    /// Resolve the freshest frame available for a visual question: queue
    /// first, cached frame as fallback. Missing frames are normal, not an
    /// error.
    pub fn freshest_frame(&self) -> Option<String> {
        self.frame_queue.pop().or_else(|| self.last_frame())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the session; the logs become read-only inputs for the report.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        info!("Procedure session closed: {:?}", self.folder);
    }
}
