//! In-memory journal for tests and simulations.

use super::traits::{JournalEntry, JournalResult, JournalStore};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Keeps entries in a shared vector; clones see the same journal.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JournalStore for MemoryJournal {
    async fn append(&self, entry: JournalEntry) -> JournalResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }

    async fn replay(&self) -> JournalResult<Vec<JournalEntry>> {
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::PrivacyBudgetState;
    use crate::model::JobId;

    #[tokio::test]
    async fn test_clones_share_entries() {
        let journal = MemoryJournal::new();
        let other = journal.clone();
        let job_id = JobId::new();
        journal
            .record_budget(&PrivacyBudgetState {
                job_id,
                total_epsilon: 1.0,
                consumed_epsilon: 0.25,
            })
            .await
            .unwrap();

        assert_eq!(other.len(), 1);
        let replayed = other.replay().await.unwrap();
        assert_eq!(replayed[0].job_id(), Some(job_id));
    }
}
