//! Line-delimited JSON sink on stdout.

use std::io::Write;

use async_trait::async_trait;

use super::{LogRecord, Storage, StorageError};

/// Writes one JSON object per record, newline-terminated and flushed, to the
/// process's stdout. The stdout lock makes concurrent stores line-atomic.
#[derive(Debug, Default)]
pub struct StdoutStorage;

impl StdoutStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for StdoutStorage {
    async fn store(&self, record: LogRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(&record)?;
        let mut out = std::io::stdout().lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}
