//! Chat → assistant thread bindings.
//!
//! One assistant thread per chat. Bindings survive restarts in a small JSON
//! file; live thread handles are cached in memory.

use anyhow::Result;
use dashmap::DashMap;
use relay_assistant::{AssistantBackend, AssistantThread};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const SESSIONS_FILE_NAME: &str = "bot_sessions.json";

pub struct SessionStore {
    path: PathBuf,
    backend: Arc<dyn AssistantBackend>,
    bindings: Mutex<BTreeMap<String, String>>,
    threads: DashMap<String, Arc<dyn AssistantThread>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SessionStore {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: PathBuf, backend: Arc<dyn AssistantBackend>) -> Self {
        let bindings = read_bindings(&path).await;
        tracing::info!(bindings = bindings.len(), "session bindings loaded");
        Self {
            path,
            backend,
            bindings: Mutex::new(bindings),
            threads: DashMap::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock_bindings().len()
    }

    pub fn stored_thread_id(&self, chat_id: &str) -> Option<String> {
        self.lock_bindings().get(chat_id).cloned()
    }

    /// Thread for `chat_id`: the cached one, else the stored binding resumed,
    /// else a fresh thread.
    pub fn thread_for(&self, chat_id: &str) -> Arc<dyn AssistantThread> {
        if let Some(thread) = self.threads.get(chat_id) {
            return thread.clone();
        }

        let thread = match self.stored_thread_id(chat_id) {
            Some(thread_id) => match self.backend.resume_thread(&thread_id) {
                Ok(thread) => {
                    tracing::debug!(chat_id, thread_id = %thread_id, "resumed assistant thread");
                    thread
                }
                Err(e) => {
                    tracing::warn!(%e, chat_id, thread_id = %thread_id, "resume failed; starting a new thread");
                    self.backend.start_thread()
                }
            },
            None => self.backend.start_thread(),
        };
        self.threads.insert(chat_id.to_string(), thread.clone());
        thread
    }

    /// Record `thread_id` for `chat_id`; writes only when the binding changed.
    pub async fn bind(&self, chat_id: &str, thread_id: &str) -> Result<()> {
        let changed = {
            let mut bindings = self.lock_bindings();
            if bindings.get(chat_id).map(String::as_str) == Some(thread_id) {
                false
            } else {
                bindings.insert(chat_id.to_string(), thread_id.to_string());
                true
            }
        };
        if changed {
            tracing::debug!(chat_id, thread_id, "session binding updated");
            self.persist().await?;
        }
        Ok(())
    }

    /// Forget the chat's thread. Returns whether a binding or live thread existed.
    pub async fn clear(&self, chat_id: &str) -> Result<bool> {
        let had_thread = self.threads.remove(chat_id).is_some();
        let had_binding = self.lock_bindings().remove(chat_id).is_some();
        if had_binding {
            self.persist().await?;
        }
        Ok(had_thread || had_binding)
    }

    fn lock_bindings(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let payload = serde_json::to_vec_pretty(&*self.lock_bindings())?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn read_bindings(path: &Path) -> BTreeMap<String, String> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "session file unreadable; starting empty");
            return BTreeMap::new();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(bindings) => bindings,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "session file is not valid json; starting empty");
            BTreeMap::new()
        }
    }
}
