//! Append-only journal file.
//!
//! Each entry is `[len: u32 BE][CBOR(JournalEntry)]`. A torn write at the
//! tail (crash mid-append) is ignored on replay; everything before it is
//! intact.

use super::traits::{JournalEntry, JournalError, JournalResult, JournalStore};
use crate::serialization::{from_cbor, to_cbor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Largest single entry (64 MiB).
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

/// Journal backed by one file on disk.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open (or create) the journal at `path`.
    pub async fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode_all(bytes: &[u8]) -> Vec<JournalEntry> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            if bytes.len() - offset < 4 {
                warn!(offset, "truncated journal length prefix, ignoring tail");
                break;
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            let start = offset + 4;
            if len > MAX_ENTRY_LEN || bytes.len() - start < len {
                warn!(offset, len, "truncated journal entry, ignoring tail");
                break;
            }
            match from_cbor::<JournalEntry>(&bytes[start..start + len]) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(offset, error = %e, "undecodable journal entry, ignoring tail");
                    break;
                }
            }
            offset = start + len;
        }
        entries
    }
}

#[async_trait]
impl JournalStore for FileJournal {
    async fn append(&self, entry: JournalEntry) -> JournalResult<()> {
        let body = to_cbor(&entry)?;
        if body.len() > MAX_ENTRY_LEN {
            return Err(JournalError::EntryTooLarge(body.len()));
        }
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);

        let mut file = self.file.lock().await;
        file.write_all(&framed).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn replay(&self) -> JournalResult<Vec<JournalEntry>> {
        // Hold the writer lock so replay never observes a half-written entry
        let _guard = self.file.lock().await;
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Self::decode_all(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use crate::privacy::PrivacyBudgetState;
    use tempfile::TempDir;

    fn budget(job_id: JobId, consumed: f64) -> PrivacyBudgetState {
        PrivacyBudgetState {
            job_id,
            total_epsilon: 1.0,
            consumed_epsilon: consumed,
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.bin");
        let job_id = JobId::new();

        {
            let journal = FileJournal::open(&path).await.unwrap();
            journal.record_budget(&budget(job_id, 0.2)).await.unwrap();
            journal.record_budget(&budget(job_id, 0.4)).await.unwrap();
        }

        let reopened = FileJournal::open(&path).await.unwrap();
        let entries = reopened.replay().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            JournalEntry::Budget {
                state: budget(job_id, 0.4)
            }
        );
        assert_eq!(reopened.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.bin");
        let job_id = JobId::new();

        let journal = FileJournal::open(&path).await.unwrap();
        journal.record_budget(&budget(job_id, 0.1)).await.unwrap();
        drop(journal);

        // Simulate a crash halfway through the next append
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&[0xa1, 0x01]);
        std::fs::write(&path, bytes).unwrap();

        let journal = FileJournal::open(&path).await.unwrap();
        assert_eq!(journal.replay().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_journal_replays_nothing() {
        let dir = TempDir::new().unwrap();
        let journal = FileJournal::open(dir.path().join("j.bin")).await.unwrap();
        assert!(journal.replay().await.unwrap().is_empty());
    }
}
