//! Conversation history passed into each request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// What the user asked.
    #[serde(default)]
    pub user: String,
    /// What the agent answered.
    #[serde(default)]
    pub assistant: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered turns, oldest first.
///
/// Serialises as a plain JSON array so session stores can keep it as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    entries: Vec<HistoryEntry>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn stamped with the current time.
    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.entries.push(HistoryEntry::new(user, assistant));
    }

    pub fn push_entry(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The last `n` turns, still oldest first.
    pub fn recent(&self, n: usize) -> &[HistoryEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<HistoryEntry>> for ConversationHistory {
    fn from(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<HistoryEntry> for ConversationHistory {
    fn from_iter<I: IntoIterator<Item = HistoryEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
