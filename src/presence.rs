//! Lobby presence as a pure reducer.
//!
//! The transport announces membership on `presence-lobby`; this module folds
//! those announcements into a name-keyed member map. Names are not unique at
//! the transport level, so a later connection with the same name replaces the
//! earlier entry, and a leave only removes an entry whose connection id matches.

use crate::protocol::{ChannelEvent, LOBBY_CHANNEL};
use crate::transport::{Transport, TransportResult};
use crate::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full snapshot, replaces whatever was known
    MemberList(Vec<PresenceMember>),
    Join(PresenceMember),
    Leave(PresenceMember),
}

impl PresenceEvent {
    pub fn from_channel(event: &ChannelEvent) -> Option<Self> {
        match event {
            ChannelEvent::SubscriptionSucceeded { members } => {
                Some(Self::MemberList(members.clone()))
            }
            ChannelEvent::MemberAdded { member } => Some(Self::Join(member.clone())),
            ChannelEvent::MemberRemoved { member } => Some(Self::Leave(member.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyState {
    members: BTreeMap<String, PresenceMember>,
}

impl LobbyState {
    pub fn members(&self) -> impl Iterator<Item = &PresenceMember> {
        self.members.values()
    }

    pub fn get(&self, name: &str) -> Option<&PresenceMember> {
        self.members.get(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub fn reduce(mut state: LobbyState, event: PresenceEvent) -> LobbyState {
    match event {
        PresenceEvent::MemberList(members) => {
            state.members = members
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect();
        }
        PresenceEvent::Join(member) => {
            state.members.insert(member.name.clone(), member);
        }
        PresenceEvent::Leave(member) => {
            let matches = state
                .members
                .get(&member.name)
                .is_some_and(|known| known.connection_id == member.connection_id);
            if matches {
                state.members.remove(&member.name);
            }
        }
    }
    state
}

/// Presence Registry for one client
pub struct PresenceRegistry {
    transport: Option<Arc<dyn Transport>>,
    state: LobbyState,
    joined: bool,
}

impl PresenceRegistry {
    pub fn new(transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            transport,
            state: LobbyState::default(),
            joined: false,
        }
    }

    /// Subscribe to the lobby. Without a transport this degrades to "no presence".
    pub async fn join(&mut self) -> TransportResult<Option<PresenceMember>> {
        let Some(transport) = &self.transport else {
            tracing::warn!("No transport configured, presence unavailable");
            return Ok(None);
        };
        transport.subscribe(LOBBY_CHANNEL, None).await?;
        self.joined = true;
        let member = transport.identity().member();
        tracing::info!("{} joined the lobby", member.name);
        Ok(Some(member))
    }

    pub async fn leave(&mut self) -> TransportResult<()> {
        if let Some(transport) = &self.transport {
            if self.joined {
                transport.unsubscribe(LOBBY_CHANNEL).await?;
            }
        }
        self.joined = false;
        self.state = LobbyState::default();
        Ok(())
    }

    /// Apply a lobby channel event; returns whether it was a presence event
    pub fn apply(&mut self, event: &ChannelEvent) -> bool {
        match PresenceEvent::from_channel(event) {
            Some(event) => {
                let state = std::mem::take(&mut self.state);
                self.state = reduce(state, event);
                true
            }
            None => false,
        }
    }

    /// Known lobby members, never including the local identity
    pub fn list(&self) -> Vec<PresenceMember> {
        let own = self.transport.as_ref().map(|t| t.identity().name.as_str());
        self.state
            .members()
            .filter(|m| Some(m.name.as_str()) != own)
            .cloned()
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&PresenceMember> {
        self.state.get(name)
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, conn: &str) -> PresenceMember {
        PresenceMember {
            connection_id: conn.to_string(),
            name: name.to_string(),
            faction: None,
        }
    }

    #[test]
    fn test_join_is_idempotent() {
        let state = reduce(LobbyState::default(), PresenceEvent::Join(member("a", "1")));
        let state = reduce(state, PresenceEvent::Join(member("a", "1")));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_leave_unknown_is_noop() {
        let state = reduce(LobbyState::default(), PresenceEvent::Join(member("a", "1")));
        let state = reduce(state.clone(), PresenceEvent::Leave(member("ghost", "9")));
        assert_eq!(state.len(), 1);
        let empty = reduce(LobbyState::default(), PresenceEvent::Leave(member("a", "1")));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_same_name_replaces_and_stale_leave_ignored() {
        let state = reduce(LobbyState::default(), PresenceEvent::Join(member("a", "1")));
        let state = reduce(state, PresenceEvent::Join(member("a", "2")));
        assert_eq!(state.get("a").unwrap().connection_id, "2");

        // The first connection dropping must not evict the newer one
        let state = reduce(state, PresenceEvent::Leave(member("a", "1")));
        assert_eq!(state.get("a").unwrap().connection_id, "2");

        let state = reduce(state, PresenceEvent::Leave(member("a", "2")));
        assert!(state.is_empty());
    }

    #[test]
    fn test_member_list_replaces_state() {
        let state = reduce(LobbyState::default(), PresenceEvent::Join(member("old", "1")));
        let state = reduce(
            state,
            PresenceEvent::MemberList(vec![member("a", "2"), member("b", "3")]),
        );
        let names: Vec<&str> = state.members().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_join_without_transport_is_noop() {
        let mut registry = PresenceRegistry::new(None);
        assert_eq!(registry.join().await.unwrap(), None);
        assert!(!registry.is_joined());
        assert!(registry.leave().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_excludes_self() {
        let hub = crate::transport::Hub::new(crate::auth::ChannelAuthorizer::new("s"));
        let (alice, mut inbox) = hub.connect("alice", None).await;
        let (bob, _bob_inbox) = hub.connect("bob", None).await;
        bob.subscribe(LOBBY_CHANNEL, None).await.unwrap();

        let mut registry = PresenceRegistry::new(Some(Arc::new(alice)));
        let joined = registry.join().await.unwrap().unwrap();
        assert_eq!(joined.name, "alice");

        while let Ok(delivery) = inbox.try_recv() {
            registry.apply(&delivery.event);
        }
        let names: Vec<String> = registry.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["bob".to_string()]);
    }
}
