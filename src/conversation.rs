//! Conversation history
//!
//! One [`ConversationEntry`] per finalized utterance, capped with FIFO
//! eviction.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of retained entries
pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// One user turn and the assistant's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationEntry {
    /// Entry id (`entry-<recording id>`)
    pub id: String,
    /// Recording this entry was created for
    pub recording_id: u64,
    /// Transcript of the user's utterance
    pub transcript: Option<String>,
    /// Assistant reply text
    pub response: Option<String>,
    /// Reply audio location
    pub audio_url: Option<String>,
    /// User-facing error, if the turn failed
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ConversationEntry {
    /// Create an empty entry for a recording
    #[must_use]
    pub fn new(recording_id: u64) -> Self {
        Self {
            id: format!("entry-{recording_id}"),
            recording_id,
            transcript: None,
            response: None,
            audio_url: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Bounded conversation log
#[derive(Debug, Clone)]
pub struct ConversationLog {
    entries: VecDeque<ConversationEntry>,
    max_entries: usize,
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ConversationLog {
    /// Create a log holding at most `max_entries` (at least one)
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    /// Append an entry, evicting the oldest beyond the cap
    ///
    /// Returns the evicted entry, if any.
    pub fn push(&mut self, entry: ConversationEntry) -> Option<ConversationEntry> {
        self.entries.push_back(entry);
        if self.entries.len() > self.max_entries {
            let evicted = self.entries.pop_front();
            if let Some(old) = &evicted {
                tracing::trace!(id = %old.id, "conversation entry evicted");
            }
            return evicted;
        }
        None
    }

    /// Mutable access to an entry by id
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ConversationEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Entry by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.entries.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured cap
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction() {
        let mut log = ConversationLog::new(3);
        for id in 1..=3 {
            assert!(log.push(ConversationEntry::new(id)).is_none());
        }

        let evicted = log.push(ConversationEntry::new(4)).unwrap();
        assert_eq!(evicted.id, "entry-1");
        assert_eq!(log.len(), 3);
        let ids: Vec<_> = log.iter().map(|e| e.recording_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_update_in_place() {
        let mut log = ConversationLog::default();
        log.push(ConversationEntry::new(9));
        log.get_mut("entry-9").unwrap().transcript = Some("hello".to_string());
        assert_eq!(log.get("entry-9").unwrap().transcript.as_deref(), Some("hello"));
        assert!(log.get("entry-1").is_none());
    }

    #[test]
    fn test_zero_cap_keeps_one() {
        let mut log = ConversationLog::new(0);
        log.push(ConversationEntry::new(1));
        log.push(ConversationEntry::new(2));
        assert_eq!(log.len(), 1);
    }
}
