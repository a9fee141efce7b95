//! # Report Composer
//!
//! Produces exactly one structured post-operative report per session from the
//! annotation and note logs, map-reduce style: logs are rendered to lines,
//! summarized in chunks, reduced, and the combined summaries drive one final
//! schema-constrained completion.
//!
//! `compose` is non-failing by contract. A generative backend asked for a
//! large JSON document will sometimes truncate it mid-token, so the final
//! parse goes through a staged chain: truncation detection with one
//! re-request at a doubled output budget, mechanical JSON repair, default
//! backfill of missing fields, and a placeholder report as the last resort.

use crate::agents::annotation::SceneAnnotation;
use crate::agents::notetaker::Note;
use crate::completion::{CompletionClient, CompletionOptions};
use crate::session::{JsonArrayLog, ANNOTATION_FILE, NOTES_FILE, REPORT_FILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a surgical documentation assistant. You \
write concise, factual post-operative notes from procedure records. Respond \
with JSON only.";

/// Notes that carry no content worth reporting.
const PLACEHOLDER_NOTES: &[&str] = &["take a note", "note", "new note"];

fn not_specified() -> String {
    "Not specified".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureInformation {
    pub procedure_type: String,
    pub date: String,
    pub duration: String,
    pub surgeon: String,
}

impl Default for ProcedureInformation {
    fn default() -> Self {
        Self {
            procedure_type: not_specified(),
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
            duration: not_specified(),
            surgeon: not_specified(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineEvent {
    pub time: String,
    pub description: String,
}

/// The post-operative report. Produced once, persisted, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureReport {
    pub procedure_information: ProcedureInformation,
    pub findings: Vec<String>,
    pub procedure_timeline: Vec<TimelineEvent>,
    pub complications: Vec<String>,
}

impl Default for ProcedureReport {
    fn default() -> Self {
        Self {
            procedure_information: ProcedureInformation::default(),
            findings: vec!["No findings recorded".to_string()],
            procedure_timeline: Vec::new(),
            complications: Vec::new(),
        }
    }
}

pub struct ReportComposer {
    client: Arc<dyn CompletionClient>,
    chunk_size: usize,
    max_tokens: u32,
}

impl ReportComposer {
    pub fn new(client: Arc<dyn CompletionClient>, chunk_size: usize, max_tokens: u32) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            max_tokens,
        }
    }

    fn report_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "procedure_information": {
                    "type": "object",
                    "properties": {
                        "procedure_type": {"type": "string"},
                        "date": {"type": "string"},
                        "duration": {"type": "string"},
                        "surgeon": {"type": "string"}
                    },
                    "required": ["procedure_type", "date", "duration", "surgeon"]
                },
                "findings": {"type": "array", "items": {"type": "string"}},
                "procedure_timeline": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "time": {"type": "string"},
                            "description": {"type": "string"}
                        },
                        "required": ["time", "description"]
                    }
                },
                "complications": {"type": "array", "items": {"type": "string"}}
            },
            "required": [
                "procedure_information",
                "findings",
                "procedure_timeline",
                "complications"
            ]
        })
    }

    /// Compose the report for a session folder and persist it as
    /// `post_op_note.json`. Never fails: every degradation path ends in a
    /// well-formed report.
    pub async fn compose(&self, folder: &Path) -> ProcedureReport {
        let annotations: Vec<SceneAnnotation> =
            JsonArrayLog::new(folder.join(ANNOTATION_FILE)).read_all();
        let notes: Vec<Note> = JsonArrayLog::new(folder.join(NOTES_FILE)).read_all();

        let report = if annotations.is_empty() && notes.is_empty() {
            info!("Both logs empty, producing minimal report");
            ProcedureReport::default()
        } else {
            self.compose_from_logs(&annotations, &notes).await
        };

        if let Err(e) = std::fs::write(
            folder.join(REPORT_FILE),
            serde_json::to_string_pretty(&report).unwrap_or_default(),
        ) {
            warn!("Could not persist report: {}", e);
        }
        report
    }

    async fn compose_from_logs(
        &self,
        annotations: &[SceneAnnotation],
        notes: &[Note],
    ) -> ProcedureReport {
        let annotation_summary = self
            .summarize_lines(&render_annotations(annotations))
            .await;
        let note_summary = self.summarize_lines(&render_notes(notes)).await;

        let prompt = format!(
            "Write the post-operative report for this procedure.\n\n\
             Scene annotation summary:\n{}\n\n\
             Operator note summary:\n{}\n\n\
             Use elapsed times from the annotations for the timeline. List \
             complications only if the records mention them.",
            if annotation_summary.is_empty() {
                "(no annotations recorded)"
            } else {
                annotation_summary.as_str()
            },
            if note_summary.is_empty() {
                "(no notes recorded)"
            } else {
                note_summary.as_str()
            },
        );

        self.request_report(&prompt).await
    }

    /// Map-reduce summarization of rendered log lines. The first line is the
    /// aggregate header and rides along with every chunk.
    ///
    /// Per-chunk failures degrade to dropped summaries rather than failing
    /// the report.
    pub(crate) async fn summarize_lines(&self, lines: &[String]) -> String {
        let (header, body) = match lines.split_first() {
            Some(split) => split,
            None => return String::new(),
        };
        if body.is_empty() {
            return String::new();
        }

        if body.len() <= self.chunk_size {
            return self
                .summary_call(header, body, "Summarize these procedure records.")
                .await
                .unwrap_or_default();
        }

        let mut chunk_summaries = Vec::new();
        for chunk in body.chunks(self.chunk_size) {
            match self
                .summary_call(header, chunk, "Summarize this segment of the procedure records.")
                .await
            {
                Ok(summary) if !summary.trim().is_empty() => chunk_summaries.push(summary),
                Ok(_) => debug!("Empty chunk summary dropped"),
                Err(e) => warn!("Chunk summary failed, dropping chunk: {}", e),
            }
        }

        if chunk_summaries.is_empty() {
            return "Unable to generate summary from the recorded data.".to_string();
        }

        match self
            .summary_call(
                header,
                &chunk_summaries,
                "Combine these segment summaries into one summary of the whole procedure.",
            )
            .await
        {
            Ok(reduced) if !reduced.trim().is_empty() => reduced,
            _ => chunk_summaries.join("\n"),
        }
    }

    async fn summary_call(
        &self,
        header: &str,
        lines: &[String],
        instruction: &str,
    ) -> crate::error::AppResult<String> {
        let prompt = format!("{}\n\n{}\n{}", instruction, header, lines.join("\n"));
        let opts = CompletionOptions {
            temperature: 0.3,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            max_tokens: self.max_tokens,
            ..Default::default()
        };
        self.client.complete_text(&prompt, &opts).await
    }

    /// Request the final report, walking the degradation chain on bad output.
    async fn request_report(&self, prompt: &str) -> ProcedureReport {
        let opts = CompletionOptions {
            temperature: 0.3,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            schema: Some(Self::report_schema()),
            max_tokens: self.max_tokens,
            ..Default::default()
        };

        let raw = match self.client.complete_text(prompt, &opts).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Report completion failed: {}", e);
                return placeholder_report();
            }
        };

        if let Some(report) = parse_report(&raw) {
            return report;
        }

        if looks_truncated(&raw) {
            // One re-request with an explicit completeness instruction and
            // twice the output budget.
            info!("Report output looks truncated, re-requesting");
            let retry_opts = CompletionOptions {
                max_tokens: self.max_tokens.saturating_mul(2),
                ..opts
            };
            let retry_prompt = format!(
                "{}\n\nYour previous answer was cut off. The response must be \
                 complete, valid JSON.",
                prompt
            );
            if let Ok(raw) = self.client.complete_text(&retry_prompt, &retry_opts).await {
                if let Some(report) = parse_report(&raw) {
                    return report;
                }
                if let Some(report) = repair_report(&raw) {
                    return report;
                }
            }
        }

        if let Some(report) = repair_report(&raw) {
            return report;
        }

        warn!("Report output unrecoverable, using placeholder");
        placeholder_report()
    }
}

/// Render annotations as lines, first line an aggregate header.
pub(crate) fn render_annotations(annotations: &[SceneAnnotation]) -> Vec<String> {
    if annotations.is_empty() {
        return Vec::new();
    }

    let mut phases = BTreeSet::new();
    let mut tools = BTreeSet::new();
    let mut anatomy = BTreeSet::new();
    for a in annotations {
        phases.insert(a.phase.as_str());
        tools.extend(a.tools.iter().map(String::as_str));
        anatomy.extend(a.anatomy.iter().map(String::as_str));
    }
    let header = format!(
        "ALL PHASES: {} | ALL TOOLS: {} | ALL ANATOMY: {}",
        join_set(&phases),
        join_set(&tools),
        join_set(&anatomy)
    );

    let mut lines = vec![header];
    lines.extend(annotations.iter().map(|a| {
        format!(
            "[{:.0}s] phase: {}; tools: {}; anatomy: {}; {}",
            a.elapsed_seconds,
            a.phase,
            a.tools.join(", "),
            a.anatomy.join(", "),
            a.description
        )
    }));
    lines
}

/// Render notes as lines, first line a count header. Empty and placeholder
/// notes are excluded from the count and the body.
pub(crate) fn render_notes(notes: &[Note]) -> Vec<String> {
    let valid: Vec<&Note> = notes
        .iter()
        .filter(|n| {
            let text = n.text.trim().to_lowercase();
            !text.is_empty() && !PLACEHOLDER_NOTES.contains(&text.as_str())
        })
        .collect();
    if valid.is_empty() {
        return Vec::new();
    }

    let mut lines = vec![format!("TOTAL NOTES: {}", valid.len())];
    lines.extend(valid.iter().map(|n| format!("[{}] {}", n.timestamp, n.text)));
    lines
}

fn join_set(set: &BTreeSet<&str>) -> String {
    set.iter().copied().collect::<Vec<_>>().join(", ")
}

fn parse_report(raw: &str) -> Option<ProcedureReport> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    value.as_object()?;
    serde_json::from_value(backfill_defaults(value)).ok()
}

/// Heuristic check for output cut off mid-document.
pub(crate) fn looks_truncated(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }

    let mut depth = 0i64;
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }
    if depth > 0 || in_string {
        return true;
    }

    matches!(trimmed.chars().last(), Some(',') | Some(':') | Some('"'))
        && !trimmed.ends_with('}')
}

/// Mechanical repair of truncated JSON: cut to the first `{`, close an open
/// string, drop dangling separators, strip trailing commas, balance the
/// delimiters, then backfill missing top-level fields from the defaults.
pub(crate) fn repair_report(raw: &str) -> Option<ProcedureReport> {
    let start = raw.find('{')?;
    let mut text = raw[start..].trim_end().to_string();

    // Close an unterminated string literal
    let mut in_string = false;
    let mut escaped = false;
    let mut open_stack: Vec<char> = Vec::new();
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => open_stack.push('}'),
            '[' if !in_string => open_stack.push(']'),
            '}' | ']' if !in_string => {
                open_stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        text.push('"');
    }

    // Drop a dangling separator at the cut point
    loop {
        let trimmed = text.trim_end().to_string();
        if trimmed.ends_with(',') || trimmed.ends_with(':') {
            text = trimmed[..trimmed.len() - 1].to_string();
        } else {
            text = trimmed;
            break;
        }
    }

    // Balance whatever is still open, innermost first
    while let Some(closer) = open_stack.pop() {
        text.push(closer);
    }

    let text = strip_trailing_commas(&text);
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    value.as_object()?;

    debug!("Report JSON repaired");
    serde_json::from_value(backfill_defaults(value)).ok()
}

/// Remove commas that directly precede a closing delimiter.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Fill missing top-level report fields from the canonical default, keeping
/// everything the backend did provide.
fn backfill_defaults(mut value: serde_json::Value) -> serde_json::Value {
    let defaults = serde_json::to_value(ProcedureReport::default()).unwrap_or_default();
    if let (Some(obj), Some(default_obj)) = (value.as_object_mut(), defaults.as_object()) {
        for (key, default_value) in default_obj {
            obj.entry(key.clone()).or_insert_with(|| default_value.clone());
        }
    }
    value
}

fn placeholder_report() -> ProcedureReport {
    ProcedureReport {
        findings: vec![
            "Report generation incomplete: recorded data could not be summarized".to_string(),
        ],
        ..ProcedureReport::default()
    }
}
