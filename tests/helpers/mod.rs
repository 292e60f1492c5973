//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod mock_upstream;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shadowgate::storage::{LogRecord, Storage, StorageError};

pub use mock_upstream::{MockResponse, MockUpstream};

/// In-memory sink capturing records for assertions.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, record: LogRecord) -> Result<(), StorageError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Poll `predicate` until it returns true or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(predicate: F, what: &str) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
