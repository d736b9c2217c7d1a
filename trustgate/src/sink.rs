// trustgate/src/sink.rs
//
// Append-only JSONL file. One serialized record per line, one write per record.
// Writers are serialized through an async mutex so concurrent tasks never
// interleave partial lines.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        let line = serde_json::to_string(record)? + "\n";
        let _guard = self.lock.lock().await;
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        f.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
