//! Observability Module
//!
//! Process-level health inputs consulted by the instance loops.

mod memory;

pub use memory::MemoryGuard;
