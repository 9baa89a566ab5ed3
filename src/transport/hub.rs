use super::{Inbox, Transport, TransportError, TransportResult};
use crate::auth::ChannelAuthorizer;
use crate::protocol::{ChannelEvent, ChannelKind, Delivery};
use crate::types::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

struct ConnectionEntry {
    identity: Identity,
    outbox: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Channel name -> subscribed connection ids (ordered for deterministic fan-out)
    channels: BTreeMap<String, BTreeSet<ConnectionId>>,
}

impl HubState {
    fn members(&self, channel: &str) -> Vec<PresenceMember> {
        self.channels
            .get(channel)
            .map(|subs| {
                subs.iter()
                    .filter_map(|id| self.connections.get(id))
                    .map(|c| c.identity.member())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver to every subscriber of `channel` except `skip`.
    /// Returns connections whose inbox is gone.
    fn fan_out(
        &self,
        channel: &str,
        event: &ChannelEvent,
        skip: Option<&str>,
    ) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        let Some(subs) = self.channels.get(channel) else {
            return dead;
        };
        for id in subs {
            if Some(id.as_str()) == skip {
                continue;
            }
            if let Some(conn) = self.connections.get(id) {
                let delivery = Delivery {
                    channel: channel.to_string(),
                    event: event.clone(),
                };
                if conn.outbox.send(delivery).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        dead
    }

    fn send_to(&self, connection_id: &str, channel: &str, event: ChannelEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn
                .outbox
                .send(Delivery {
                    channel: channel.to_string(),
                    event,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Remove a connection from one channel, announcing it on presence channels
    fn leave_channel(&mut self, connection_id: &str, channel: &str) -> Vec<ConnectionId> {
        let removed = match self.channels.get_mut(channel) {
            Some(subs) => subs.remove(connection_id),
            None => false,
        };
        if !removed {
            return Vec::new();
        }
        if self.channels.get(channel).is_some_and(|s| s.is_empty()) {
            self.channels.remove(channel);
        }

        if ChannelKind::of(channel) == Some(ChannelKind::Presence) {
            if let Some(conn) = self.connections.get(connection_id) {
                let event = ChannelEvent::MemberRemoved {
                    member: conn.identity.member(),
                };
                return self.fan_out(channel, &event, None);
            }
        }
        Vec::new()
    }

    fn drop_connection(&mut self, connection_id: &str) {
        let channels: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, subs)| subs.contains(connection_id))
            .map(|(name, _)| name.clone())
            .collect();

        let mut dead = Vec::new();
        for channel in &channels {
            dead.extend(self.leave_channel(connection_id, channel));
        }
        if self.connections.remove(connection_id).is_some() {
            tracing::info!(
                "Connection {} dropped ({} channels left)",
                connection_id,
                channels.len()
            );
        }

        for id in dead {
            if id != connection_id {
                self.drop_connection(&id);
            }
        }
    }
}

/// In-process pub/sub broker with presence and private channel semantics.
///
/// Every publish holds the write lock while fanning out, so all subscribers
/// observe one channel's events in the same order. Inboxes are unbounded:
/// a slow consumer grows its queue instead of losing events.
#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    authorizer: Arc<ChannelAuthorizer>,
}

impl Hub {
    pub fn new(authorizer: ChannelAuthorizer) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            authorizer: Arc::new(authorizer),
        }
    }

    pub fn authorizer(&self) -> &ChannelAuthorizer {
        &self.authorizer
    }

    /// Open a connection; the hub assigns the connection id
    pub async fn connect(&self, name: &str, faction: Option<Faction>) -> (HubConnection, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = Identity {
            name: name.to_string(),
            connection_id: ulid::Ulid::new().to_string(),
            faction,
        };

        self.state.write().await.connections.insert(
            identity.connection_id.clone(),
            ConnectionEntry {
                identity: identity.clone(),
                outbox: tx,
            },
        );
        tracing::info!(
            "Connection {} opened for '{}'",
            identity.connection_id,
            identity.name
        );

        (
            HubConnection {
                hub: self.clone(),
                identity,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Drop a connection and leave all its channels
    pub async fn disconnect(&self, connection_id: &str) {
        self.state.write().await.drop_connection(connection_id);
    }

    pub async fn subscribe(
        &self,
        connection_id: &str,
        channel: &str,
        auth: Option<&str>,
    ) -> TransportResult<()> {
        let kind = ChannelKind::of(channel)
            .ok_or_else(|| TransportError::UnknownChannel(channel.to_string()))?;

        if kind == ChannelKind::Private {
            let token = auth.ok_or_else(|| TransportError::AuthRejected {
                channel: channel.to_string(),
                reason: "missing auth".to_string(),
            })?;
            if !self.authorizer.verify(connection_id, channel, token) {
                tracing::warn!(
                    "Rejected subscription of {} to {}: bad signature",
                    connection_id,
                    channel
                );
                return Err(TransportError::AuthRejected {
                    channel: channel.to_string(),
                    reason: "invalid signature".to_string(),
                });
            }
        }

        let mut state = self.state.write().await;
        let member = state
            .connections
            .get(connection_id)
            .map(|c| c.identity.member())
            .ok_or_else(|| TransportError::NotConnected(connection_id.to_string()))?;

        let newly_joined = state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());

        if !newly_joined {
            tracing::debug!("{} already subscribed to {}", connection_id, channel);
            return Ok(());
        }
        tracing::info!("{} subscribed to {}", member.name, channel);

        if kind == ChannelKind::Presence {
            let members = state.members(channel);
            state.send_to(
                connection_id,
                channel,
                ChannelEvent::SubscriptionSucceeded { members },
            );
            let dead = state.fan_out(
                channel,
                &ChannelEvent::MemberAdded { member },
                Some(connection_id),
            );
            for id in dead {
                state.drop_connection(&id);
            }
        }

        Ok(())
    }

    pub async fn unsubscribe(&self, connection_id: &str, channel: &str) -> TransportResult<()> {
        let mut state = self.state.write().await;
        let dead = state.leave_channel(connection_id, channel);
        for id in dead {
            state.drop_connection(&id);
        }
        Ok(())
    }

    /// Publish on behalf of a subscribed connection
    pub async fn publish(
        &self,
        connection_id: &str,
        channel: &str,
        event: ChannelEvent,
    ) -> TransportResult<()> {
        if !event.allowed_on(channel) {
            return Err(TransportError::EventNotAllowed {
                event: event.name().to_string(),
                channel: channel.to_string(),
            });
        }

        let mut state = self.state.write().await;
        let Some(publisher) = state.connections.get(connection_id) else {
            return Err(TransportError::NotConnected(connection_id.to_string()));
        };
        if let Some(claimed) = event.claimed_sender() {
            if claimed != publisher.identity.name {
                tracing::warn!(
                    "{} tried to publish {} as {}",
                    publisher.identity.name,
                    event.name(),
                    claimed
                );
                return Err(TransportError::SenderMismatch {
                    claimed: claimed.to_string(),
                    actual: publisher.identity.name.clone(),
                });
            }
        }
        let subscribed = state
            .channels
            .get(channel)
            .is_some_and(|subs| subs.contains(connection_id));
        if !subscribed {
            return Err(TransportError::NotSubscribed(channel.to_string()));
        }

        tracing::debug!("{} -> {}: {}", connection_id, channel, event.name());
        let dead = state.fan_out(channel, &event, None);
        for id in dead {
            state.drop_connection(&id);
        }
        Ok(())
    }

    /// Server-side publish that needs no subscription (used by the HTTP API)
    pub async fn trigger(&self, channel: &str, event: ChannelEvent) -> TransportResult<()> {
        if !event.allowed_on(channel) {
            return Err(TransportError::EventNotAllowed {
                event: event.name().to_string(),
                channel: channel.to_string(),
            });
        }
        let mut state = self.state.write().await;
        let dead = state.fan_out(channel, &event, None);
        for id in dead {
            state.drop_connection(&id);
        }
        Ok(())
    }

    /// Current members of a presence channel
    pub async fn members(&self, channel: &str) -> Vec<PresenceMember> {
        self.state.read().await.members(channel)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn identity(&self, connection_id: &str) -> Option<Identity> {
        self.state
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|c| c.identity.clone())
    }
}

/// An owned connection to a [`Hub`]
#[derive(Clone)]
pub struct HubConnection {
    hub: Hub,
    identity: Identity,
    closed: Arc<AtomicBool>,
}

impl HubConnection {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HubConnection {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn authorize(&self, channel: &str) -> TransportResult<String> {
        self.ensure_open()?;
        if ChannelKind::of(channel) != Some(ChannelKind::Private) {
            return Err(TransportError::UnknownChannel(channel.to_string()));
        }
        Ok(self
            .hub
            .authorizer
            .sign(&self.identity.connection_id, channel))
    }

    async fn subscribe(&self, channel: &str, auth: Option<String>) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub
            .subscribe(&self.identity.connection_id, channel, auth.as_deref())
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub
            .unsubscribe(&self.identity.connection_id, channel)
            .await
    }

    async fn publish(&self, channel: &str, event: ChannelEvent) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub
            .publish(&self.identity.connection_id, channel, event)
            .await
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.disconnect(&self.identity.connection_id).await;
    }
}
