//! # Session Timeline
//!
//! Ordered conversation log shared by every agent. Entries are
//! (user message, agent message) pairs with a slot-pairing invariant: a new
//! user message opens a slot with the agent side unset, and an agent reply
//! fills the most recently opened unset slot (or opens a new slot if none is
//! pending). Mutation happens only from the serialized dispatch path.

/// One user/agent exchange; either side may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub user: Option<String>,
    pub agent: Option<String>,
}

/// The ordered conversation log for one session.
#[derive(Debug, Default, Clone)]
pub struct SessionTimeline {
    entries: Vec<TimelineEntry>,
}

impl SessionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new slot with the given user message.
    pub fn add_user_message(&mut self, text: impl Into<String>) {
        self.entries.push(TimelineEntry {
            user: Some(text.into()),
            agent: None,
        });
    }

    /// Fill the most recently opened unset slot, or open a new agent-only
    /// slot if no user message is pending.
    pub fn add_agent_message(&mut self, text: impl Into<String>) {
        match self.entries.last_mut() {
            Some(last) if last.agent.is_none() => {
                last.agent = Some(text.into());
            }
            _ => {
                self.entries.push(TimelineEntry {
                    user: None,
                    agent: Some(text.into()),
                });
            }
        }
    }

    /// Whether the given text already appears as a user message.
    pub fn has_user_message(&self, text: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.user.as_deref() == Some(text))
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the last `window` exchanges as a prompt fragment.
    ///
    /// The utterance currently being dispatched is not in the timeline yet
    /// (it is recorded after its reply), so everything here is history.
    pub fn render_history(&self, window: usize) -> String {
        let mut rendered = String::new();
        let start = self.entries.len().saturating_sub(window);

        for entry in &self.entries[start..] {
            if let Some(user) = &entry.user {
                rendered.push_str("User: ");
                rendered.push_str(user);
                rendered.push('\n');
            }
            if let Some(agent) = &entry.agent {
                rendered.push_str("Assistant: ");
                rendered.push_str(agent);
                rendered.push('\n');
            }
        }
        rendered
    }
}
