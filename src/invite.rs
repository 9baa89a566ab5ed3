//! Invitation Coordinator: the request/accept handshake before a human match.
//!
//! Everything travels on the shared lobby channel, so every client sees every
//! invite. Only events whose `target_user` is the local name are acted upon.

use crate::protocol::{ChannelEvent, LOBBY_CHANNEL};
use crate::transport::{Transport, TransportError};
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InviteError {
    #[error("Already waiting on invite {session_id}")]
    AlreadyWaiting { session_id: SessionId },
    #[error("Cannot invite yourself")]
    SelfInvite,
    #[error("No pending invite for session {0}")]
    NotFound(SessionId),
    #[error("Invite for session {0} has expired")]
    Expired(SessionId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What a received lobby event meant for this client
#[derive(Debug, Clone, PartialEq)]
pub enum InviteOutcome {
    /// Shown to the user right away
    Presented(Invite),
    /// Out of focus: queued and announced through the notifier
    Queued(Invite),
    /// Our outstanding invite was accepted
    Established { session_id: SessionId, peer: String },
    /// Our outstanding invite was declined
    Rejected { session_id: SessionId, by: String },
    Ignored,
}

/// Out-of-band alert for invites that arrive while the user looks elsewhere
pub trait InviteNotifier: Send + Sync {
    fn notify(&self, invite: &Invite);
}

/// Default notifier, just logs
pub struct LogNotifier;

impl InviteNotifier for LogNotifier {
    fn notify(&self, invite: &Invite) {
        tracing::info!(
            "New chat request from {} (session {})",
            invite.from_user,
            invite.session_id
        );
    }
}

pub struct InvitationCoordinator {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn InviteNotifier>,
    ttl: Duration,
    focused: bool,
    /// Our own outstanding invite
    waiting: Option<Invite>,
    /// Invite currently shown to the user
    presented: Option<Invite>,
    /// Invites received but not shown, oldest first
    queued: Vec<Invite>,
    /// Sessions already accepted or established, for idempotence
    accepted: HashSet<SessionId>,
}

impl InvitationCoordinator {
    pub fn new(transport: Arc<dyn Transport>, ttl: Duration) -> Self {
        Self {
            transport,
            notifier: Arc::new(LogNotifier),
            ttl,
            focused: true,
            waiting: None,
            presented: None,
            queued: Vec::new(),
            accepted: HashSet::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn InviteNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn self_name(&self) -> &str {
        &self.transport.identity().name
    }

    pub fn waiting(&self) -> Option<&Invite> {
        self.waiting.as_ref()
    }

    pub fn presented(&self) -> Option<&Invite> {
        self.presented.as_ref()
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Send an invite. Waiting is entered before the publish completes and
    /// rolled back if it fails.
    pub async fn send_invite(&mut self, target: &str) -> Result<Invite, InviteError> {
        self.expire(Utc::now());
        if let Some(waiting) = &self.waiting {
            return Err(InviteError::AlreadyWaiting {
                session_id: waiting.session_id.clone(),
            });
        }
        if target == self.self_name() {
            return Err(InviteError::SelfInvite);
        }

        let invite = Invite {
            from_user: self.self_name().to_string(),
            target_user: target.to_string(),
            session_id: new_session_id("match"),
            created_at: Utc::now(),
        };
        self.waiting = Some(invite.clone());

        let event = ChannelEvent::ChatRequest {
            from_user: invite.from_user.clone(),
            target_user: invite.target_user.clone(),
            session_id: invite.session_id.clone(),
            created_at: invite.created_at,
        };
        if let Err(e) = self.transport.publish(LOBBY_CHANNEL, event).await {
            tracing::error!("Failed to send invite to {}: {}", target, e);
            self.waiting = None;
            return Err(e.into());
        }

        tracing::info!("Invited {} (session {})", target, invite.session_id);
        Ok(invite)
    }

    /// Stop waiting. The broadcast invite cannot be retracted.
    pub fn cancel(&mut self) -> Option<Invite> {
        let cancelled = self.waiting.take();
        if let Some(invite) = &cancelled {
            tracing::info!("Cancelled invite to {}", invite.target_user);
        }
        cancelled
    }

    pub fn handle_event(&mut self, event: &ChannelEvent, now: DateTime<Utc>) -> InviteOutcome {
        self.expire(now);
        let me = self.self_name().to_string();

        match event {
            ChannelEvent::ChatRequest {
                from_user,
                target_user,
                session_id,
                created_at,
            } if *target_user == me && *from_user != me => {
                if self.knows(session_id) {
                    tracing::debug!("Duplicate invite {} ignored", session_id);
                    return InviteOutcome::Ignored;
                }
                // Both sides expire the invite from the sender's timestamp
                let invite = Invite {
                    from_user: from_user.clone(),
                    target_user: target_user.clone(),
                    session_id: session_id.clone(),
                    created_at: *created_at,
                };
                if invite.is_expired(now, self.ttl) {
                    tracing::debug!("Invite {} from {} arrived expired", session_id, from_user);
                    return InviteOutcome::Ignored;
                }
                if self.focused {
                    if let Some(previous) = self.presented.replace(invite.clone()) {
                        self.queued.push(previous);
                    }
                    InviteOutcome::Presented(invite)
                } else {
                    self.notifier.notify(&invite);
                    self.queued.push(invite.clone());
                    InviteOutcome::Queued(invite)
                }
            }
            ChannelEvent::ChatAccepted {
                from_user,
                target_user,
                session_id,
            } if *target_user == me => {
                if !self.is_waiting_on(session_id, from_user) {
                    tracing::info!(
                        "Ignoring accept from {} for session {}: not the pending invite",
                        from_user,
                        session_id
                    );
                    return InviteOutcome::Ignored;
                }
                self.waiting = None;
                self.accepted.insert(session_id.clone());
                tracing::info!("{} accepted session {}", from_user, session_id);
                InviteOutcome::Established {
                    session_id: session_id.clone(),
                    peer: from_user.clone(),
                }
            }
            ChannelEvent::ChatRejected {
                from_user,
                target_user,
                session_id,
            } if *target_user == me && self.is_waiting_on(session_id, from_user) => {
                self.waiting = None;
                tracing::info!("{} declined session {}", from_user, session_id);
                InviteOutcome::Rejected {
                    session_id: session_id.clone(),
                    by: from_user.clone(),
                }
            }
            _ => InviteOutcome::Ignored,
        }
    }

    /// Only the invited user can answer the pending invite
    fn is_waiting_on(&self, session_id: &str, peer: &str) -> bool {
        self.waiting
            .as_ref()
            .is_some_and(|w| w.session_id == session_id && w.target_user == peer)
    }

    fn knows(&self, session_id: &str) -> bool {
        self.accepted.contains(session_id)
            || self
                .presented
                .as_ref()
                .is_some_and(|i| i.session_id == session_id)
            || self.queued.iter().any(|i| i.session_id == session_id)
    }

    /// Focus change. Regaining focus presents the newest queued invite.
    pub fn set_focus(&mut self, focused: bool) -> Option<&Invite> {
        self.focused = focused;
        if !focused {
            return None;
        }
        self.expire(Utc::now());

        let newest_queued = self
            .queued
            .iter()
            .enumerate()
            .max_by_key(|(_, i)| i.created_at)
            .map(|(idx, i)| (idx, i.created_at));

        if let Some((idx, created_at)) = newest_queued {
            let newer = self
                .presented
                .as_ref()
                .map_or(true, |p| p.created_at <= created_at);
            if newer {
                let invite = self.queued.remove(idx);
                if let Some(previous) = self.presented.replace(invite) {
                    self.queued.push(previous);
                }
            }
        }
        self.presented.as_ref()
    }

    fn take_received(&mut self, session_id: &str) -> Option<Invite> {
        if self
            .presented
            .as_ref()
            .is_some_and(|i| i.session_id == session_id)
        {
            return self.presented.take();
        }
        let idx = self.queued.iter().position(|i| i.session_id == session_id)?;
        Some(self.queued.remove(idx))
    }

    fn find_received(&self, session_id: &str) -> Option<&Invite> {
        self.presented
            .iter()
            .chain(self.queued.iter())
            .find(|i| i.session_id == session_id)
    }

    /// Accept a received invite. Returns `None` if it was already accepted.
    pub async fn accept(&mut self, session_id: &str) -> Result<Option<Invite>, InviteError> {
        if self.accepted.contains(session_id) {
            tracing::debug!("Session {} already accepted", session_id);
            return Ok(None);
        }
        let invite = self
            .find_received(session_id)
            .cloned()
            .ok_or_else(|| InviteError::NotFound(session_id.to_string()))?;
        if invite.is_expired(Utc::now(), self.ttl) {
            self.take_received(session_id);
            return Err(InviteError::Expired(session_id.to_string()));
        }

        let event = ChannelEvent::ChatAccepted {
            from_user: self.self_name().to_string(),
            target_user: invite.from_user.clone(),
            session_id: invite.session_id.clone(),
        };
        self.transport.publish(LOBBY_CHANNEL, event).await?;

        self.take_received(session_id);
        self.accepted.insert(session_id.to_string());
        tracing::info!("Accepted invite from {} ({})", invite.from_user, session_id);
        Ok(Some(invite))
    }

    pub async fn reject(&mut self, session_id: &str) -> Result<Invite, InviteError> {
        let invite = self
            .find_received(session_id)
            .cloned()
            .ok_or_else(|| InviteError::NotFound(session_id.to_string()))?;

        let event = ChannelEvent::ChatRejected {
            from_user: self.self_name().to_string(),
            target_user: invite.from_user.clone(),
            session_id: invite.session_id.clone(),
        };
        self.transport.publish(LOBBY_CHANNEL, event).await?;

        self.take_received(session_id);
        tracing::info!("Rejected invite from {} ({})", invite.from_user, session_id);
        Ok(invite)
    }

    /// Received invites still actionable, newest first
    pub fn pending_invites(&self) -> Vec<&Invite> {
        let now = Utc::now();
        let mut invites: Vec<&Invite> = self
            .presented
            .iter()
            .chain(self.queued.iter())
            .filter(|i| !i.is_expired(now, self.ttl))
            .collect();
        invites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        invites
    }

    /// Drop expired invites on both sides; returns what was dropped
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Invite> {
        let ttl = self.ttl;
        let mut expired = Vec::new();

        if self.waiting.as_ref().is_some_and(|i| i.is_expired(now, ttl)) {
            expired.extend(self.waiting.take());
        }
        if self
            .presented
            .as_ref()
            .is_some_and(|i| i.is_expired(now, ttl))
        {
            expired.extend(self.presented.take());
        }
        let (stale, fresh): (Vec<Invite>, Vec<Invite>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|i| i.is_expired(now, ttl));
        self.queued = fresh;
        expired.extend(stale);

        for invite in &expired {
            tracing::debug!(
                "Invite {} from {} to {} expired",
                invite.session_id,
                invite.from_user,
                invite.target_user
            );
        }
        expired
    }

    /// Forget accepted sessions, used on reset
    pub fn clear_session(&mut self, session_id: &str) {
        self.accepted.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ChannelAuthorizer;
    use crate::transport::{Hub, Inbox};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<SessionId>>,
    }

    impl InviteNotifier for RecordingNotifier {
        fn notify(&self, invite: &Invite) {
            self.seen.lock().unwrap().push(invite.session_id.clone());
        }
    }

    async fn lobby_client(hub: &Hub, name: &str) -> (InvitationCoordinator, Inbox) {
        let (conn, mut inbox) = hub.connect(name, None).await;
        conn.subscribe(LOBBY_CHANNEL, None).await.unwrap();
        while inbox.try_recv().is_ok() {}
        let coordinator = InvitationCoordinator::new(Arc::new(conn), Duration::from_secs(120));
        (coordinator, inbox)
    }

    fn next_lobby_event(inbox: &mut Inbox) -> ChannelEvent {
        loop {
            let delivery = inbox.try_recv().expect("expected an event");
            if !delivery.event.is_transport_native() {
                return delivery.event;
            }
        }
    }

    fn request(from: &str, to: &str, session: &str, sent_at: DateTime<Utc>) -> ChannelEvent {
        ChannelEvent::ChatRequest {
            from_user: from.to_string(),
            target_user: to.to_string(),
            session_id: session.to_string(),
            created_at: sent_at,
        }
    }

    #[tokio::test]
    async fn test_send_enters_waiting_and_rejects_second_send() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut alice, _) = lobby_client(&hub, "alice").await;

        let invite = alice.send_invite("bob").await.unwrap();
        assert!(invite.session_id.starts_with("match_"));
        assert_eq!(alice.waiting(), Some(&invite));

        let second = alice.send_invite("carol").await;
        assert!(matches!(second, Err(InviteError::AlreadyWaiting { .. })));

        assert_eq!(alice.send_invite("alice").await.ok(), None);
    }

    #[tokio::test]
    async fn test_failed_publish_clears_waiting() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (conn, _inbox) = hub.connect("alice", None).await;
        // Never subscribed to the lobby, so publish fails
        let mut alice = InvitationCoordinator::new(Arc::new(conn), Duration::from_secs(120));

        let result = alice.send_invite("bob").await;
        assert!(matches!(result, Err(InviteError::Transport(_))));
        assert!(alice.waiting().is_none());
    }

    #[tokio::test]
    async fn test_unfocused_invites_queue_and_newest_wins_on_focus() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (bob, _) = lobby_client(&hub, "bob").await;
        let notifier = Arc::new(RecordingNotifier::default());
        let mut bob = bob.with_notifier(notifier.clone());
        bob.set_focus(false);

        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let first = bob.handle_event(&request("alice", "bob", "s1", t0), t0);
        let second = bob.handle_event(&request("carol", "bob", "s2", t1), t1);
        assert!(matches!(first, InviteOutcome::Queued(_)));
        assert!(matches!(second, InviteOutcome::Queued(_)));
        assert_eq!(*notifier.seen.lock().unwrap(), vec!["s1", "s2"]);
        assert!(bob.presented().is_none());

        let shown = bob.set_focus(true).cloned().unwrap();
        assert_eq!(shown.session_id, "s2");

        let pending: Vec<&str> = bob
            .pending_invites()
            .iter()
            .map(|i| i.session_id.as_str())
            .collect();
        assert_eq!(pending, vec!["s2", "s1"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_invites_ignored() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut bob, _) = lobby_client(&hub, "bob").await;
        let now = Utc::now();

        assert!(matches!(
            bob.handle_event(&request("alice", "bob", "s1", now), now),
            InviteOutcome::Presented(_)
        ));
        assert_eq!(
            bob.handle_event(&request("alice", "bob", "s1", now), now),
            InviteOutcome::Ignored
        );
        assert_eq!(
            bob.handle_event(&request("alice", "carol", "s3", now), now),
            InviteOutcome::Ignored
        );
        assert_eq!(bob.pending_invites().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_is_idempotent_and_reaches_sender() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut alice, mut alice_inbox) = lobby_client(&hub, "alice").await;
        let (mut bob, mut bob_inbox) = lobby_client(&hub, "bob").await;
        while alice_inbox.try_recv().is_ok() {}

        let invite = alice.send_invite("bob").await.unwrap();
        let received = next_lobby_event(&mut bob_inbox);
        assert!(matches!(
            bob.handle_event(&received, Utc::now()),
            InviteOutcome::Presented(_)
        ));

        let accepted = bob.accept(&invite.session_id).await.unwrap();
        assert_eq!(accepted.map(|i| i.session_id), Some(invite.session_id.clone()));
        assert_eq!(bob.accept(&invite.session_id).await.unwrap(), None);

        // alice's own request echo first, then bob's accept
        let echo = next_lobby_event(&mut alice_inbox);
        assert_eq!(alice.handle_event(&echo, Utc::now()), InviteOutcome::Ignored);
        let accept = next_lobby_event(&mut alice_inbox);
        assert_eq!(
            alice.handle_event(&accept, Utc::now()),
            InviteOutcome::Established {
                session_id: invite.session_id,
                peer: "bob".to_string(),
            }
        );
        assert!(alice.waiting().is_none());
        assert!(alice_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_clears_waiting() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut alice, mut alice_inbox) = lobby_client(&hub, "alice").await;
        let (mut bob, mut bob_inbox) = lobby_client(&hub, "bob").await;
        while alice_inbox.try_recv().is_ok() {}

        let invite = alice.send_invite("bob").await.unwrap();
        let received = next_lobby_event(&mut bob_inbox);
        bob.handle_event(&received, Utc::now());
        bob.reject(&invite.session_id).await.unwrap();
        assert!(bob.pending_invites().is_empty());

        next_lobby_event(&mut alice_inbox);
        let rejection = next_lobby_event(&mut alice_inbox);
        assert!(matches!(
            alice.handle_event(&rejection, Utc::now()),
            InviteOutcome::Rejected { .. }
        ));
        assert!(alice.waiting().is_none());
    }

    #[tokio::test]
    async fn test_late_accept_after_cancel_is_ignored() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut alice, _) = lobby_client(&hub, "alice").await;

        let invite = alice.send_invite("bob").await.unwrap();
        assert!(alice.cancel().is_some());

        let late = ChannelEvent::ChatAccepted {
            from_user: "bob".to_string(),
            target_user: "alice".to_string(),
            session_id: invite.session_id,
        };
        assert_eq!(alice.handle_event(&late, Utc::now()), InviteOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_expired_invites_are_pruned() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut bob, _) = lobby_client(&hub, "bob").await;
        let old = Utc::now() - chrono::Duration::seconds(600);
        bob.handle_event(&request("alice", "bob", "old", old), old);

        assert!(bob.pending_invites().is_empty());
        assert_eq!(
            bob.accept("old").await,
            Err(InviteError::Expired("old".to_string()))
        );
        assert!(bob.expire(Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn test_only_the_invited_user_can_answer() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut alice, _) = lobby_client(&hub, "alice").await;
        let invite = alice.send_invite("bob").await.unwrap();

        let accepted = |from: &str| ChannelEvent::ChatAccepted {
            from_user: from.to_string(),
            target_user: "alice".to_string(),
            session_id: invite.session_id.clone(),
        };
        let rejected = ChannelEvent::ChatRejected {
            from_user: "carol".to_string(),
            target_user: "alice".to_string(),
            session_id: invite.session_id.clone(),
        };

        assert_eq!(
            alice.handle_event(&accepted("carol"), Utc::now()),
            InviteOutcome::Ignored
        );
        assert_eq!(
            alice.handle_event(&rejected, Utc::now()),
            InviteOutcome::Ignored
        );
        assert_eq!(alice.waiting(), Some(&invite));

        assert_eq!(
            alice.handle_event(&accepted("bob"), Utc::now()),
            InviteOutcome::Established {
                session_id: invite.session_id.clone(),
                peer: "bob".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_received_invite_expires_from_sender_timestamp() {
        let hub = Hub::new(ChannelAuthorizer::new("s"));
        let (mut bob, _) = lobby_client(&hub, "bob").await;
        let now = Utc::now();
        let sent_at = now - chrono::Duration::seconds(100);

        match bob.handle_event(&request("alice", "bob", "s1", sent_at), now) {
            InviteOutcome::Presented(invite) => assert_eq!(invite.created_at, sent_at),
            other => panic!("Expected Presented, got {:?}", other),
        }
        let expired = bob.expire(now + chrono::Duration::seconds(30));
        assert_eq!(expired.len(), 1);

        let stale = now - chrono::Duration::seconds(600);
        assert_eq!(
            bob.handle_event(&request("alice", "bob", "s2", stale), now),
            InviteOutcome::Ignored
        );
    }
}
