//! Pub/sub transport
//!
//! The coordination components only talk to the outside world through the
//! [`Transport`] trait: subscribe/unsubscribe/publish on named channels, with
//! presence semantics for `presence-*` channels and an authorization
//! handshake for `private-*` channels. [`Hub`] is the in-process broker that
//! implements those semantics; the WebSocket bridge exposes it to browsers.

mod hub;

use crate::protocol::{ChannelEvent, Delivery};
use crate::types::Identity;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use hub::{Hub, HubConnection};

/// Events delivered to one connection, in per-channel publish order
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("Connection {0} is not connected")]
    NotConnected(String),

    #[error("Unknown channel type: {0}")]
    UnknownChannel(String),

    #[error("Subscription to {channel} rejected: {reason}")]
    AuthRejected { channel: String, reason: String },

    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("Event '{event}' is not allowed on {channel}")]
    EventNotAllowed { event: String, channel: String },

    #[error("{actual} cannot publish as {claimed}")]
    SenderMismatch { claimed: String, actual: String },

    #[error("Connection is closed")]
    Closed,
}

/// A single owned connection to the pub/sub transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this connection presents, including its transport-assigned id
    fn identity(&self) -> &Identity;

    /// Obtain the signature needed to subscribe to a private channel
    async fn authorize(&self, channel: &str) -> TransportResult<String>;

    async fn subscribe(&self, channel: &str, auth: Option<String>) -> TransportResult<()>;

    /// Leaving a channel we never joined is a no-op
    async fn unsubscribe(&self, channel: &str) -> TransportResult<()>;

    async fn publish(&self, channel: &str, event: ChannelEvent) -> TransportResult<()>;

    /// Tear the connection down; presence channels announce the departure.
    /// Afterwards every operation fails with [`TransportError::Closed`].
    async fn disconnect(&self);
}
