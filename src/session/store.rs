//! Session persistence back ends.
//!
//! A store only has to honour two semantics: insert-only fields are never
//! overwritten by a repeated start, and appends happen in one step under the
//! store's own lock so concurrent appends from both participants interleave
//! instead of clobbering each other.

use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store data is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Store snapshot version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert `session` if its id is unknown, otherwise only reactivate it
    async fn upsert_start(&self, session: Session) -> StoreResult<Session>;

    /// Append to the message log. With `insert`, a missing session is created
    /// from it first; without, a missing session yields `None`.
    async fn push_messages(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        insert: Option<Session>,
    ) -> StoreResult<Option<Session>>;

    async fn set_status(&self, session_id: &str, status: SessionStatus)
        -> StoreResult<Option<Session>>;

    /// Record a guess unless its player already has one; returns the stored session
    async fn record_guess(&self, session_id: &str, guess: GuessRecord)
        -> StoreResult<Option<Session>>;

    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>>;
}

/// Shared mutation logic for map-backed stores
fn upsert_into(sessions: &mut HashMap<SessionId, Session>, session: Session) -> Session {
    sessions
        .entry(session.session_id.clone())
        .and_modify(|existing| existing.status = SessionStatus::Active)
        .or_insert(session)
        .clone()
}

fn push_into(
    sessions: &mut HashMap<SessionId, Session>,
    session_id: &str,
    messages: Vec<Message>,
    insert: Option<Session>,
) -> Option<Session> {
    if !sessions.contains_key(session_id) {
        let session = insert?;
        sessions.insert(session_id.to_string(), session);
    }
    let session = sessions.get_mut(session_id)?;
    session.messages.extend(messages);
    Some(session.clone())
}

fn guess_into(
    sessions: &mut HashMap<SessionId, Session>,
    session_id: &str,
    guess: GuessRecord,
) -> Option<Session> {
    let session = sessions.get_mut(session_id)?;
    if session.guess_of(&guess.player).is_none() {
        session.guesses.push(guess);
    }
    Some(session.clone())
}

/// Volatile store, also used as the registry's fallback
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_start(&self, session: Session) -> StoreResult<Session> {
        Ok(upsert_into(&mut *self.sessions.write().await, session))
    }

    async fn push_messages(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        insert: Option<Session>,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.write().await;
        Ok(push_into(&mut sessions, session_id, messages, insert))
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(session_id).map(|s| {
            s.status = status;
            s.clone()
        }))
    }

    async fn record_guess(
        &self,
        session_id: &str,
        guess: GuessRecord,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.write().await;
        Ok(guess_into(&mut sessions, session_id, guess))
    }

    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}

/// Schema version of the JSON snapshot
/// Version 1: sessions with messages and one recorded guess
/// Version 2: guesses recorded per participant (v1 guesses are not carried over)
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    /// Export timestamp (ISO8601)
    pub exported_at: String,
    #[serde(default)]
    pub sessions: HashMap<SessionId, Session>,
}

impl SessionSnapshot {
    pub fn new(sessions: HashMap<SessionId, Session>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            sessions,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: self.schema_version,
                supported: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

/// Store that rewrites a JSON snapshot file after every mutation
pub struct JsonFileStore {
    path: PathBuf,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl JsonFileStore {
    /// Open the store, loading an existing snapshot if there is one
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sessions = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)?;
                snapshot.validate()?;
                tracing::info!(
                    "Loaded {} sessions from {}",
                    snapshot.sessions.len(),
                    path.display()
                );
                snapshot.sessions
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temp file so a crash never leaves half a snapshot
    async fn persist(&self, sessions: &HashMap<SessionId, Session>) -> StoreResult<()> {
        let snapshot = SessionSnapshot::new(sessions.clone());
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn upsert_start(&self, session: Session) -> StoreResult<Session> {
        let mut sessions = self.sessions.lock().await;
        let stored = upsert_into(&mut sessions, session);
        self.persist(&sessions).await?;
        Ok(stored)
    }

    async fn push_messages(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        insert: Option<Session>,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        let stored = push_into(&mut sessions, session_id, messages, insert);
        if stored.is_some() {
            self.persist(&sessions).await?;
        }
        Ok(stored)
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        session.status = status;
        let stored = session.clone();
        self.persist(&sessions).await?;
        Ok(Some(stored))
    }

    async fn record_guess(
        &self,
        session_id: &str,
        guess: GuessRecord,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        let stored = guess_into(&mut sessions, session_id, guess);
        if stored.is_some() {
            self.persist(&sessions).await?;
        }
        Ok(stored)
    }

    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }
}
