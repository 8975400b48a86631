//! Append-only per-session Markdown sink.
//!
//! Appends for one session are serialized; different sessions never wait on
//! each other.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn append(&self, session_id: &str, text: &str) -> io::Result<()>;

    /// Everything appended so far, or `None` for an unknown session.
    async fn read(&self, session_id: &str) -> io::Result<Option<String>>;

    /// Drop any in-process bookkeeping for a session; its content stays.
    fn forget(&self, _session_id: &str) {}
}

/// One `<dir>/<session>.md` file per session.
pub struct FileSessionCache {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileSessionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(file_name(session_id))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(file_name(session_id))
            .or_default()
            .clone()
    }
}

/// `<id>.md` with every byte outside `[A-Za-z0-9-]` written as `_xx`, so
/// distinct ids never share a file and none can leave the cache dir.
fn file_name(session_id: &str) -> String {
    let mut name = String::with_capacity(session_id.len() + 3);
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("_{byte:02x}"));
        }
    }
    name.push_str(".md");
    name
}

#[async_trait]
impl SessionCache for FileSessionCache {
    async fn append(&self, session_id: &str, text: &str) -> io::Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }

    async fn read(&self, session_id: &str) -> io::Result<Option<String>> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        match tokio::fs::read_to_string(self.path_for(session_id)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn forget(&self, session_id: &str) {
        self.locks.remove(&file_name(session_id));
    }
}

#[derive(Default)]
pub struct InMemorySessionCache {
    entries: DashMap<String, String>,
}

impl InMemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for InMemorySessionCache {
    async fn append(&self, session_id: &str, text: &str) -> io::Result<()> {
        self.entries
            .entry(session_id.to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn read(&self, session_id: &str) -> io::Result<Option<String>> {
        Ok(self.entries.get(session_id).map(|entry| entry.clone()))
    }
}
