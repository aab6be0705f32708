//! Durable record of registrations, job transitions, updates and results.
//!
//! - `traits`: the `JournalStore` boundary and `JournalEntry`
//! - `memory`: shared in-memory journal
//! - `journal`: append-only file journal

pub mod journal;
pub mod memory;
pub mod traits;

pub use journal::FileJournal;
pub use memory::MemoryJournal;
pub use traits::{JournalEntry, JournalError, JournalResult, JournalStore};
