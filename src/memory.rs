//! In-memory broadcast hub.
//!
//! Implements [`BroadcastTransport`] over a shared in-process hub so that
//! several clients can talk to each other without a network service. Used by
//! the loopback binary and the tests.
//!
//! WARNING: This is NOT a production transport. Nothing leaves the process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::transport::{BroadcastTransport, ChannelHandle, Credentials, TransportEvent};
use crate::types::{ChannelBoxError, Result};

#[derive(Default)]
struct Member {
    logged_in: bool,
    channels: HashSet<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

#[derive(Default)]
struct HubState {
    required_token: Option<String>,
    channels: HashMap<String, Vec<String>>,
    members: HashMap<u64, Member>,
    next_member: u64,
}

/// Shared in-process message bus.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Creates a hub that accepts any non-empty token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hub that only accepts `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        let hub = Self::default();
        hub.lock().required_token = Some(token.into());
        hub
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a channel. Creating an existing channel is a no-op.
    pub fn create_channel(&self, channel_id: impl Into<String>) {
        self.lock().channels.entry(channel_id.into()).or_default();
    }

    /// Attach a new participant.
    pub fn transport(&self) -> MemoryTransport {
        let mut state = self.lock();
        let member_id = state.next_member;
        state.next_member += 1;
        state.members.insert(member_id, Member::default());
        MemoryTransport {
            hub: self.clone(),
            member_id,
        }
    }

    /// Every message sent to `channel_id` so far, oldest first.
    pub fn history(&self, channel_id: &str) -> Vec<String> {
        self.lock()
            .channels
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver raw text to every member of a channel, as if some foreign
    /// client had sent it.
    pub fn publish_raw(&self, channel_id: &str, text: impl Into<String>) -> Result<()> {
        self.publish(channel_id, text.into())
    }

    /// Send a rate-limit notice to every subscribed member.
    pub fn rate_limit_all(&self, timeout_ms: u64) {
        let state = self.lock();
        for member in state.members.values() {
            if let Some(events) = &member.events {
                let _ = events.send(TransportEvent::RateLimited { timeout_ms });
            }
        }
    }

    fn publish(&self, channel_id: &str, text: String) -> Result<()> {
        let mut state = self.lock();
        let history = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelBoxError::TransportError(format!("unknown channel: {channel_id}")))?;
        history.push(text.clone());

        for member in state.members.values() {
            if !member.channels.contains(channel_id) {
                continue;
            }
            if let Some(events) = &member.events {
                let _ = events.send(TransportEvent::Message(text.clone()));
            }
        }
        Ok(())
    }
}

/// One participant's connection to a [`MemoryHub`]. Clones address the same
/// participant.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    member_id: u64,
}

impl MemoryTransport {
    /// Push an event to this participant only.
    ///
    /// Returns `false` when nobody is subscribed.
    pub fn inject(&self, event: TransportEvent) -> bool {
        let state = self.hub.lock();
        state
            .members
            .get(&self.member_id)
            .and_then(|member| member.events.as_ref())
            .map(|events| events.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait::async_trait]
impl BroadcastTransport for MemoryTransport {
    async fn login(&self, credentials: &Credentials) -> Result<()> {
        let mut state = self.hub.lock();
        let accepted = match &state.required_token {
            Some(required) => required == credentials.token(),
            None => !credentials.is_empty(),
        };
        if !accepted {
            return Err(ChannelBoxError::TransportError("login rejected".to_string()));
        }

        let member = state.members.entry(self.member_id).or_default();
        member.logged_in = true;
        if let Some(events) = &member.events {
            let _ = events.send(TransportEvent::Ready);
        }
        Ok(())
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelHandle> {
        let mut state = self.hub.lock();
        if !state.channels.contains_key(channel_id) {
            return Err(ChannelBoxError::TransportError(format!(
                "channel not found: {channel_id}"
            )));
        }
        let member = state.members.entry(self.member_id).or_default();
        if !member.logged_in {
            return Err(ChannelBoxError::TransportError("not logged in".to_string()));
        }
        member.channels.insert(channel_id.to_string());
        Ok(ChannelHandle::new(channel_id))
    }

    async fn send(&self, channel: &ChannelHandle, text: String) -> Result<()> {
        {
            let state = self.hub.lock();
            let joined = state
                .members
                .get(&self.member_id)
                .map(|member| member.channels.contains(channel.id()))
                .unwrap_or(false);
            if !joined {
                return Err(ChannelBoxError::TransportError(format!(
                    "not a member of channel {}",
                    channel.id()
                )));
            }
        }
        self.hub.publish(channel.id(), text)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.hub
            .lock()
            .members
            .entry(self.member_id)
            .or_default()
            .events = Some(sender);
        receiver
    }

    async fn unsubscribe(&self) {
        if let Some(member) = self.hub.lock().members.get_mut(&self.member_id) {
            member.events = None;
            member.channels.clear();
            member.logged_in = false;
        }
    }
}
