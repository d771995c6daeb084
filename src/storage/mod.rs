//! Storage Module
//!
//! Robin-Hood hash table, tagged values and the serializing storage task
//! that owns one table and one journal per instance.

mod engine;
mod hashtable;
mod value;

pub use engine::{Operation, OperationOutput, StorageEngine, StorageHandle};
pub use hashtable::{Entry, HashTable, TableStats};
pub use value::Value;
