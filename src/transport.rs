//! Broadcast transport interface.
//!
//! The concrete pub/sub service (login, channels, delivery, rate limiting) is
//! an external collaborator. This module defines the seam the client drives;
//! implementations can wrap any chat service or message bus.

use std::fmt;

use tokio::sync::mpsc;

use crate::types::Result;

/// Login credentials for the transport.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// A fetched channel that envelopes can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: String,
}

impl ChannelHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Login completed; channels may now be fetched.
    Ready,
    /// A text message arrived on a subscribed channel.
    Message(String),
    /// The service asked us to back off.
    RateLimited { timeout_ms: u64 },
    /// The session was invalidated by the service.
    Invalidated,
}

/// Trait for a many-to-many broadcast channel.
///
/// Every participant receives every message sent to a channel, including its
/// own; addressing and filtering are left to the receiver.
#[async_trait::async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Authenticate. On success a [`TransportEvent::Ready`] follows on the
    /// event stream.
    async fn login(&self, credentials: &Credentials) -> Result<()>;

    /// Look up a channel by id.
    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelHandle>;

    /// Send UTF-8 text to a channel. Fire-and-forget: no delivery guarantee.
    async fn send(&self, channel: &ChannelHandle, text: String) -> Result<()>;

    /// Start receiving events. A second call replaces the previous stream.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Stop receiving events and release any channel membership.
    async fn unsubscribe(&self);
}
