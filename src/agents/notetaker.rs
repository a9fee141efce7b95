//! # Note Taker
//!
//! Synchronous operator note capture. Each note is appended to the session's
//! note log; when the triggering message carried a frame, the image is
//! decoded from its data URI and stored alongside under `note_images/`.

use crate::agents::AgentReply;
use crate::error::AppResult;
use crate::session::ProcedureSession;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// One recorded operator note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub timestamp: String,
    pub text: String,
    /// File name under `note_images/`, when an image was captured with the note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
}

pub struct NoteTaker {
    session: Arc<ProcedureSession>,
}

impl NoteTaker {
    pub fn new(session: Arc<ProcedureSession>) -> Self {
        Self { session }
    }

    /// Record a note, storing its image when one decodes cleanly. Image
    /// decode failure is non-fatal: the note is kept without the reference.
    pub fn record_note(&self, text: &str, frame: Option<&str>) -> AppResult<AgentReply> {
        let now = chrono::Local::now();
        let image_file = frame.and_then(|frame| match self.store_image(frame, &now) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("Note image could not be stored: {}", e);
                None
            }
        });

        let note = Note {
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            text: text.to_string(),
            image_file,
        };
        self.session.note_log().append(&note)?;

        let count = self.session.note_log().len();
        info!("Note {} recorded: {}", count, text);
        Ok(AgentReply::note(format!(
            "Note {} recorded: {}",
            count, note.text
        )))
    }

    /// Decode a `data:image/...;base64,` URI and write it under
    /// `note_images/` as `note_<timestamp>__<suffix>.{jpg|png}`.
    fn store_image(&self, data_uri: &str, now: &chrono::DateTime<chrono::Local>) -> AppResult<String> {
        let (extension, payload) = split_data_uri(data_uri)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;

        let suffix = now.timestamp_subsec_millis();
        let file_name = format!(
            "note_{}__{}.{}",
            now.format("%Y_%m_%d__%H_%M_%S"),
            suffix,
            extension
        );
        std::fs::write(self.session.note_images_dir().join(&file_name), bytes)?;
        Ok(file_name)
    }
}

/// Split a data URI into its image extension and base64 payload.
fn split_data_uri(data_uri: &str) -> AppResult<(&'static str, &str)> {
    let extension = if data_uri.starts_with("data:image/png") {
        "png"
    } else if data_uri.starts_with("data:image/jpeg") || data_uri.starts_with("data:image/jpg") {
        "jpg"
    } else {
        // Char-based truncation: byte slicing could land inside a multibyte
        // character in a client-supplied string.
        let prefix: String = data_uri.chars().take(32).collect();
        return Err(crate::error::AppError::BadRequest(format!(
            "Unsupported image data URI prefix: {}",
            prefix
        )));
    };
    let payload = data_uri
        .split_once(";base64,")
        .map(|(_, payload)| payload)
        .ok_or_else(|| {
            crate::error::AppError::BadRequest("Data URI missing base64 payload".to_string())
        })?;
    Ok((extension, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, Arc<ProcedureSession>) {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ProcedureSession::create(dir.path(), 8).unwrap());
        (dir, session)
    }

    #[test]
    fn test_note_without_image() {
        let (_dir, session) = session();
        let notetaker = NoteTaker::new(session.clone());

        let reply = notetaker.record_note("bleeding near the duct", None).unwrap();

        assert!(reply.is_note);
        assert!(reply.text.starts_with("Note 1 recorded"));
        let notes: Vec<Note> = session.note_log().read_all();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].text, "bleeding near the duct");
        assert!(notes[0].image_file.is_none());
    }

    #[test]
    fn test_note_with_image_stores_file() {
        let (_dir, session) = session();
        let notetaker = NoteTaker::new(session.clone());

        // 1x1 transparent PNG
        let frame = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
        notetaker.record_note("clip applied", Some(frame)).unwrap();

        let notes: Vec<Note> = session.note_log().read_all();
        let image_file = notes[0].image_file.as_ref().unwrap();
        assert!(image_file.starts_with("note_"));
        assert!(image_file.ends_with(".png"));
        assert!(session.note_images_dir().join(image_file).exists());
    }

    #[test]
    fn test_image_decode_failure_is_non_fatal() {
        let (_dir, session) = session();
        let notetaker = NoteTaker::new(session.clone());

        let reply = notetaker
            .record_note("note anyway", Some("data:image/png;base64,%%%not-base64%%%"))
            .unwrap();

        assert!(reply.is_note);
        let notes: Vec<Note> = session.note_log().read_all();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].image_file.is_none());
    }

    #[test]
    fn test_ack_counts_grow() {
        let (_dir, session) = session();
        let notetaker = NoteTaker::new(session);

        notetaker.record_note("first", None).unwrap();
        let reply = notetaker.record_note("second", None).unwrap();
        assert!(reply.text.starts_with("Note 2 recorded"));
    }

    #[test]
    fn test_split_data_uri_rejects_unknown_prefix() {
        assert!(split_data_uri("data:audio/wav;base64,abcd").is_err());
        assert!(split_data_uri("data:image/png").is_err());
        let (ext, payload) = split_data_uri("data:image/jpeg;base64,abcd").unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(payload, "abcd");
    }

    #[test]
    fn test_unknown_prefix_with_multibyte_chars_does_not_panic() {
        // A multibyte character straddling the truncation point must not
        // split the string mid-character.
        let uri = format!("data:image/unknownformatxyz{}", "é".repeat(21));
        assert!(split_data_uri(&uri).is_err());
    }
}
