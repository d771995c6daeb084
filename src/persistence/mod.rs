//! Persistence Module
//!
//! Append-only journaling for crash recovery.

mod journal;

pub use journal::{Journal, JournalRecord, MutationOp};
