//! # Agents
//!
//! The capability consumers behind the dispatch pipeline: chat, note taking,
//! background scene annotation, and report composition, plus the router that
//! decides which one handles an utterance.

pub mod annotation;
pub mod chat;
pub mod notetaker;
pub mod report;
pub mod router;

/// Closed set of capabilities an utterance can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    NoteTaker,
    Report,
}

impl Capability {
    /// Parse the router's selection string. Case-exact: anything outside the
    /// enum's wire names is invalid.
    pub fn from_selection(selection: &str) -> Option<Self> {
        match selection {
            "chat" => Some(Capability::Chat),
            "notetaker" => Some(Capability::NoteTaker),
            "report" => Some(Capability::Report),
            _ => None,
        }
    }
}

/// Reply produced by a capability consumer, carrying the tags the transport
/// layer needs to shape the outbound message.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    /// Set when the reply acknowledges a recorded note
    pub is_note: bool,
}

impl AgentReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_note: false,
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_note: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_selection_is_case_exact() {
        assert_eq!(Capability::from_selection("chat"), Some(Capability::Chat));
        assert_eq!(
            Capability::from_selection("notetaker"),
            Some(Capability::NoteTaker)
        );
        assert_eq!(
            Capability::from_selection("report"),
            Some(Capability::Report)
        );
        assert_eq!(Capability::from_selection("Chat"), None);
        assert_eq!(Capability::from_selection("NOTETAKER"), None);
        assert_eq!(Capability::from_selection("summary"), None);
    }
}
