//! Storage Engine Task
//!
//! One serializing task owns an instance's hash table and journal; handlers
//! submit work items over a queue and await the result on a oneshot
//! channel. Serialization through a single owner preserves the table
//! invariants without locks.

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::persistence::{Journal, JournalRecord, MutationOp};
use crate::storage::hashtable::{HashTable, TableStats};
use crate::storage::value::Value;

/// A storage request submitted to the engine.
#[derive(Debug, Clone)]
pub enum Operation {
    Put { key: String, value: String },
    Get { key: String },
    Del { key: String },
    Incr { key: String, delta: String },
    Decr { key: String, delta: String },
    Regx {
        pattern: String,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Stats,
}

/// Result payload of a completed operation.
#[derive(Debug, Clone)]
pub enum OperationOutput {
    /// Mutation applied (PUT/DEL).
    Done,
    /// Single value (GET/INCR/DECR).
    Value(String),
    /// Matched key-value pairs in scan order (REGX).
    Entries(Vec<(String, String)>),
    Stats(TableStats),
}

struct WorkItem {
    op: Operation,
    reply: oneshot::Sender<Result<OperationOutput>>,
}

enum EngineMsg {
    Work(WorkItem),
    Shutdown(oneshot::Sender<()>),
}

/// Spawns the serializing storage task.
pub struct StorageEngine;

impl StorageEngine {
    /// Start the engine on its own thread and return the submission handle.
    /// The engine exits when asked to shut down, when every handle is
    /// dropped, or fatally when a journal append fails.
    pub fn spawn(table: HashTable, journal: Option<Journal>) -> StorageHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || run(table, journal, rx));
        StorageHandle { tx }
    }

    /// Apply a replayed journal record to a table during recovery. Replay
    /// errors are logged and skipped; the journal is the history of
    /// accepted mutations, so a record that no longer applies cannot be
    /// fixed here.
    pub fn apply_record(table: &mut HashTable, record: JournalRecord) {
        let outcome = match record.op {
            MutationOp::Put => {
                table.put(&record.key, Value::lift(&record.value));
                Ok(())
            }
            MutationOp::Del => {
                table.delete(&record.key);
                Ok(())
            }
            MutationOp::Incr => table.incr(&record.key, &record.value).map(|_| ()),
            MutationOp::Decr => table.decr(&record.key, &record.value).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(key = %record.key, error = %e, "skipping journal record during replay");
        }
    }
}

/// Cloneable handle for submitting operations to the engine.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl StorageHandle {
    /// Submit an operation and await its result.
    pub async fn execute(&self, op: Operation) -> Result<OperationOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Work(WorkItem {
                op,
                reply: reply_tx,
            }))
            .map_err(|_| Error::EngineStopped)?;
        reply_rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Drain pending work, flush and close the journal, stop the engine.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(EngineMsg::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn run(
    mut table: HashTable,
    mut journal: Option<Journal>,
    mut rx: mpsc::UnboundedReceiver<EngineMsg>,
) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            EngineMsg::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
            EngineMsg::Work(item) => {
                let result = apply(&mut table, journal.as_mut(), item.op);
                // An instance may not silently lose a mutation it has
                // acknowledged, so a failed append stops the engine.
                let fatal = matches!(&result, Err(Error::Io(_)));
                let _ = item.reply.send(result);
                if fatal {
                    error!("journal append failed, stopping storage engine");
                    break;
                }
            }
        }
    }
    if let Some(journal) = journal.take() {
        if let Err(e) = journal.close() {
            error!(error = %e, "failed to close journal");
        }
    }
}

fn apply(
    table: &mut HashTable,
    journal: Option<&mut Journal>,
    op: Operation,
) -> Result<OperationOutput> {
    match op {
        Operation::Put { key, value } => {
            table.put(&key, Value::lift(&value));
            journal_append(journal, JournalRecord::new(MutationOp::Put, key, value))?;
            Ok(OperationOutput::Done)
        }
        Operation::Get { key } => table
            .get(&key)
            .map(|(value, _)| OperationOutput::Value(value.to_string()))
            .ok_or(Error::KeyNotFound),
        Operation::Del { key } => {
            if !table.delete(&key) {
                return Err(Error::KeyNotFound);
            }
            journal_append(journal, JournalRecord::new(MutationOp::Del, key, ""))?;
            Ok(OperationOutput::Done)
        }
        Operation::Incr { key, delta } => {
            let value = table.incr(&key, &delta)?;
            journal_append(journal, JournalRecord::new(MutationOp::Incr, key, delta))?;
            Ok(OperationOutput::Value(value.to_string()))
        }
        Operation::Decr { key, delta } => {
            let value = table.decr(&key, &delta)?;
            journal_append(journal, JournalRecord::new(MutationOp::Decr, key, delta))?;
            Ok(OperationOutput::Value(value.to_string()))
        }
        Operation::Regx {
            pattern,
            limit,
            offset,
        } => {
            let entries = table.get_with_regex(&pattern, limit, offset)?;
            Ok(OperationOutput::Entries(
                entries
                    .into_iter()
                    .map(|entry| (entry.key, entry.value.to_string()))
                    .collect(),
            ))
        }
        Operation::Stats => Ok(OperationOutput::Stats(table.stats())),
    }
}

fn journal_append(journal: Option<&mut Journal>, record: JournalRecord) -> Result<()> {
    if let Some(journal) = journal {
        journal.append(&record)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_engine_serializes_operations() {
        let handle = StorageEngine::spawn(HashTable::new(), None);

        assert!(matches!(
            handle
                .execute(Operation::Put {
                    key: "hello".into(),
                    value: "world".into()
                })
                .await
                .unwrap(),
            OperationOutput::Done
        ));

        match handle
            .execute(Operation::Get {
                key: "hello".into(),
            })
            .await
            .unwrap()
        {
            OperationOutput::Value(v) => assert_eq!(v, "world"),
            other => panic!("unexpected output: {:?}", other),
        }

        assert!(matches!(
            handle
                .execute(Operation::Get {
                    key: "missing".into()
                })
                .await,
            Err(Error::KeyNotFound)
        ));

        handle.shutdown().await;
        assert!(matches!(
            handle
                .execute(Operation::Get {
                    key: "hello".into()
                })
                .await,
            Err(Error::EngineStopped)
        ));
    }

    #[tokio::test]
    async fn test_engine_journals_mutations_for_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");

        let handle = StorageEngine::spawn(HashTable::new(), Some(Journal::open(&path).unwrap()));
        handle
            .execute(Operation::Put {
                key: "n".into(),
                value: "0".into(),
            })
            .await
            .unwrap();
        handle
            .execute(Operation::Incr {
                key: "n".into(),
                delta: "5".into(),
            })
            .await
            .unwrap();
        handle
            .execute(Operation::Put {
                key: "gone".into(),
                value: "x".into(),
            })
            .await
            .unwrap();
        handle
            .execute(Operation::Del {
                key: "gone".into(),
            })
            .await
            .unwrap();
        handle.shutdown().await;

        // Recovery replays into an empty table.
        let mut table = HashTable::new();
        Journal::replay(&path, |record| {
            StorageEngine::apply_record(&mut table, record);
        })
        .unwrap();
        assert_eq!(table.get("n").map(|(v, _)| v.to_string()), Some("5".into()));
        assert!(table.get("gone").is_none());
    }

    #[tokio::test]
    async fn test_reads_are_not_journaled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");

        let handle = StorageEngine::spawn(HashTable::new(), Some(Journal::open(&path).unwrap()));
        handle
            .execute(Operation::Put {
                key: "k".into(),
                value: "v".into(),
            })
            .await
            .unwrap();
        handle.execute(Operation::Get { key: "k".into() }).await.unwrap();
        handle.execute(Operation::Stats).await.unwrap();
        handle.shutdown().await;

        let mut count = 0;
        Journal::replay(&path, |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }
}
