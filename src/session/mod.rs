//! Session Registry: best-effort bookkeeping of sessions, messages and guesses.
//!
//! Gameplay never waits on durability. Every store failure is logged and the
//! operation is retried against an in-memory fallback.

pub mod score;
mod store;

pub use store::{
    JsonFileStore, MemoryStore, SessionSnapshot, SessionStore, StoreError, StoreResult,
    SNAPSHOT_SCHEMA_VERSION,
};

use crate::types::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    fallback: Arc<MemoryStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            fallback: Arc::new(MemoryStore::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Idempotent upsert: a repeat start keeps `start_time`, `opponent_kind`
    /// and `model_id` and only reactivates the session
    pub async fn start(&self, session_id: &str, opponent: &OpponentDescriptor) -> Session {
        let session = Session::new(session_id.to_string(), opponent, Utc::now());
        match self.store.upsert_start(session.clone()).await {
            Ok(stored) => {
                tracing::info!(
                    "Session {} started ({:?}{})",
                    session_id,
                    stored.opponent_kind,
                    stored
                        .model_id
                        .as_deref()
                        .map(|m| format!(", {}", m))
                        .unwrap_or_default()
                );
                stored
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to persist start of session {}: {}. Using in-memory fallback.",
                    session_id,
                    e
                );
                // MemoryStore never fails
                self.fallback
                    .upsert_start(session.clone())
                    .await
                    .unwrap_or(session)
            }
        }
    }

    /// Append messages. `upsert` creates the session when it does not exist yet.
    /// A missing session without upsert is `None`, never an error.
    pub async fn append_messages(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        upsert: Option<&OpponentDescriptor>,
    ) -> Option<Session> {
        if messages.is_empty() {
            return self.get(session_id).await;
        }
        let insert = upsert.map(|d| Session::new(session_id.to_string(), d, Utc::now()));

        let result = match self
            .store
            .push_messages(session_id, messages.clone(), insert.clone())
            .await
        {
            Ok(Some(session)) => Some(session),
            // Started while the store was down
            Ok(None) => self
                .fallback
                .push_messages(session_id, messages, None)
                .await
                .ok()
                .flatten(),
            Err(e) => {
                tracing::warn!(
                    "Failed to log {} messages for session {}: {}. Using in-memory fallback.",
                    messages.len(),
                    session_id,
                    e
                );
                self.fallback
                    .push_messages(session_id, messages, insert)
                    .await
                    .ok()
                    .flatten()
            }
        };

        match &result {
            Some(session) => tracing::debug!(
                "Session {} now has {} messages",
                session_id,
                session.messages.len()
            ),
            None => tracing::warn!("Session {} not found, messages not logged", session_id),
        }
        result
    }

    pub async fn end(&self, session_id: &str) -> Option<Session> {
        let (stored, store_failed) =
            match self.store.set_status(session_id, SessionStatus::Closed).await {
                Ok(stored) => (stored, false),
                Err(e) => {
                    tracing::warn!("Failed to persist end of session {}: {}", session_id, e);
                    (None, true)
                }
            };
        let result = match stored {
            Some(session) => Some(session),
            None => self
                .fallback
                .set_status(session_id, SessionStatus::Closed)
                .await
                .ok()
                .flatten(),
        };
        match &result {
            Some(_) => tracing::info!("Session {} closed", session_id),
            None if store_failed => {
                tracing::warn!("Session {} unreachable while the store is down", session_id)
            }
            None => tracing::warn!("Cannot close unknown session {}", session_id),
        }
        result
    }

    /// Score `player`'s guess once. Repeats by the same player return the
    /// recorded result; every participant is scored on their own guess.
    pub async fn submit_guess(
        &self,
        session_id: &str,
        player: &str,
        guess: Guess,
        decision_time: DateTime<Utc>,
    ) -> Option<GuessOutcome> {
        let (session, in_fallback) = self.lookup(session_id).await?;
        if let Some(recorded) = session.guess_of(player) {
            tracing::debug!("Session {} already judged by {}", session_id, player);
            return Some(recorded.into());
        }

        let outcome = score::compute(
            session.opponent_kind,
            guess,
            session.start_time,
            decision_time,
            session.messages.len(),
        );
        let record = GuessRecord {
            player: player.to_string(),
            player_guess: guess,
            is_correct: outcome.is_correct,
            decision_time,
            score: outcome.score,
        };

        let stored = if in_fallback {
            self.fallback.record_guess(session_id, record).await.ok().flatten()
        } else {
            match self.store.record_guess(session_id, record.clone()).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!("Failed to persist guess for {}: {}", session_id, e);
                    self.fallback.upsert_start(session).await.ok();
                    self.fallback.record_guess(session_id, record).await.ok().flatten()
                }
            }
        };

        // A concurrent submit may have won the race
        let outcome = stored
            .and_then(|s| s.guess_of(player).map(GuessOutcome::from))
            .unwrap_or(outcome);
        tracing::info!(
            "Session {} judged by {}: guess {:?}, correct={}, score={}",
            session_id,
            player,
            guess,
            outcome.is_correct,
            outcome.score
        );
        Some(outcome)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.lookup(session_id).await.map(|(s, _)| s)
    }

    async fn lookup(&self, session_id: &str) -> Option<(Session, bool)> {
        match self.store.get(session_id).await {
            Ok(Some(session)) => return Some((session, false)),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read session {}: {}", session_id, e),
        }
        self.fallback
            .get(session_id)
            .await
            .ok()
            .flatten()
            .map(|s| (s, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// A store whose back end is always down
    struct DownStore;

    #[async_trait]
    impl SessionStore for DownStore {
        async fn upsert_start(&self, _: Session) -> StoreResult<Session> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn push_messages(
            &self,
            _: &str,
            _: Vec<Message>,
            _: Option<Session>,
        ) -> StoreResult<Option<Session>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn set_status(&self, _: &str, _: SessionStatus) -> StoreResult<Option<Session>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn record_guess(&self, _: &str, _: GuessRecord) -> StoreResult<Option<Session>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn get(&self, _: &str) -> StoreResult<Option<Session>> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    /// Down until `recover` is called, then backed by memory
    #[derive(Default)]
    struct FlakyStore {
        up: std::sync::atomic::AtomicBool,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn recover(&self) {
            self.up.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn check(&self) -> StoreResult<()> {
            if self.up.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("down".to_string()))
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn upsert_start(&self, session: Session) -> StoreResult<Session> {
            self.check()?;
            self.inner.upsert_start(session).await
        }
        async fn push_messages(
            &self,
            session_id: &str,
            messages: Vec<Message>,
            insert: Option<Session>,
        ) -> StoreResult<Option<Session>> {
            self.check()?;
            self.inner.push_messages(session_id, messages, insert).await
        }
        async fn set_status(
            &self,
            session_id: &str,
            status: SessionStatus,
        ) -> StoreResult<Option<Session>> {
            self.check()?;
            self.inner.set_status(session_id, status).await
        }
        async fn record_guess(
            &self,
            session_id: &str,
            guess: GuessRecord,
        ) -> StoreResult<Option<Session>> {
            self.check()?;
            self.inner.record_guess(session_id, guess).await
        }
        async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
            self.check()?;
            self.inner.get(session_id).await
        }
    }

    #[tokio::test]
    async fn test_session_started_during_outage_survives_recovery() {
        let store = Arc::new(FlakyStore::default());
        let registry = SessionRegistry::new(store.clone());
        registry.start("s1", &OpponentDescriptor::human()).await;

        store.recover();
        let logged = registry
            .append_messages("s1", vec![Message::user("a", "hi")], None)
            .await
            .expect("messages land in the fallback");
        assert_eq!(logged.messages.len(), 1);

        let closed = registry.end("s1").await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.messages.len(), 1);
        assert!(registry
            .append_messages("ghost", vec![Message::user("a", "hi")], None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let registry = SessionRegistry::in_memory();
        let first = registry.start("s1", &OpponentDescriptor::ai("m")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry.start("s1", &OpponentDescriptor::human()).await;
        assert_eq!(first.start_time, second.start_time);
        assert_eq!(second.opponent_kind, OpponentKind::Ai);
    }

    #[tokio::test]
    async fn test_messages_only_grow() {
        let registry = SessionRegistry::in_memory();
        registry.start("s1", &OpponentDescriptor::human()).await;

        let mut last = 0;
        for i in 0..4 {
            let session = registry
                .append_messages("s1", vec![Message::user("a", format!("m{}", i))], None)
                .await
                .unwrap();
            assert!(session.messages.len() > last);
            last = session.messages.len();
        }
        let session = registry.end("s1").await.unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_unknown_session_is_soft_not_found() {
        let registry = SessionRegistry::in_memory();
        assert!(registry
            .append_messages("ghost", vec![Message::user("a", "hi")], None)
            .await
            .is_none());
        assert!(registry.end("ghost").await.is_none());
        assert!(registry
            .submit_guess("ghost", "p", OpponentKind::Ai, Utc::now())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_guess_scored_once() {
        let registry = SessionRegistry::in_memory();
        let session = registry.start("s1", &OpponentDescriptor::ai("m")).await;
        let decision = session.start_time + chrono::Duration::seconds(10);
        let messages = vec![
            Message::user("p", "hi"),
            Message::assistant("bot", "hello"),
            Message::user("p", "who are you"),
        ];
        registry.append_messages("s1", messages, None).await;

        let outcome = registry
            .submit_guess("s1", "p", OpponentKind::Ai, decision)
            .await
            .unwrap();
        assert_eq!(outcome.score, 158);

        let repeat = registry
            .submit_guess("s1", "p", OpponentKind::Human, decision)
            .await
            .unwrap();
        assert_eq!(repeat, outcome);
    }

    #[tokio::test]
    async fn test_each_participant_scored_on_own_guess() {
        let registry = SessionRegistry::in_memory();
        let session = registry.start("h1", &OpponentDescriptor::human()).await;
        let decision = session.start_time + chrono::Duration::seconds(10);

        let alice = registry
            .submit_guess("h1", "alice", OpponentKind::Human, decision)
            .await
            .unwrap();
        assert!(alice.is_correct);
        assert_eq!(alice.score, 158);

        let bob = registry
            .submit_guess("h1", "bob", OpponentKind::Ai, decision)
            .await
            .unwrap();
        assert_eq!(
            bob,
            GuessOutcome {
                is_correct: false,
                score: 0
            }
        );

        let logged = registry.get("h1").await.unwrap();
        assert_eq!(logged.guesses.len(), 2);
        assert_eq!(logged.guess_of("bob").unwrap().player_guess, OpponentKind::Ai);
    }

    #[tokio::test]
    async fn test_store_outage_falls_back_to_memory() {
        let registry = SessionRegistry::new(Arc::new(DownStore));
        let session = registry.start("s1", &OpponentDescriptor::ai("m")).await;
        assert_eq!(session.status, SessionStatus::Active);

        let logged = registry
            .append_messages("s1", vec![Message::user("a", "hi")], None)
            .await
            .unwrap();
        assert_eq!(logged.messages.len(), 1);

        let outcome = registry
            .submit_guess("s1", "p", OpponentKind::Human, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.is_correct);
        assert!(registry.end("s1").await.is_some());
    }
}
