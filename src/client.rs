//! Async client driver.
//!
//! A [`Client`] task owns the protocol state and the connection state machine
//! for one identity and handles exactly one event at a time: a transport
//! event, a cooldown tick, or a command from a [`ClientHandle`]. Handlers run
//! to completion before the next event is taken, so registry updates, master
//! changes and lock transitions never interleave.

use std::future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::envelope::Envelope;
use crate::keys::Identity;
use crate::protocol::{Protocol, ProtocolStats, SessionEvent};
use crate::transport::{BroadcastTransport, TransportEvent};
use crate::types::{ChannelBoxError, Result, KEY_SIZE};

/// Point-in-time view of a client's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub user_id: String,
    pub known_peers: Vec<String>,
    pub master_key: Option<[u8; KEY_SIZE]>,
    pub is_master: bool,
    pub can_announce_master: bool,
    pub status: ConnectionStatus,
    pub stats: ProtocolStats,
}

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Transmit {
        payload: Value,
        recipient: Option<[u8; KEY_SIZE]>,
        reply: oneshot::Sender<Result<()>>,
    },
    AnnounceMaster(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for driving a spawned [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    user_id: String,
    public_key: [u8; KEY_SIZE],
}

impl ClientHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.public_key
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| ChannelBoxError::StateError("client has shut down".to_string()))?;
        response
            .await
            .map_err(|_| ChannelBoxError::StateError("client has shut down".to_string()))
    }

    /// Log in and join the configured channel.
    ///
    /// Returns once login has been attempted; the handshake request goes out
    /// when the transport reports ready, signalled by a
    /// `SessionEvent::Connection(ConnectionStatus::Connected)` event.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Encrypt `payload` and broadcast it. `recipient` defaults to the master key.
    pub async fn transmit<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        recipient: Option<[u8; KEY_SIZE]>,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ChannelBoxError::EncryptionError(format!("JSON encode failed: {e}")))?;
        self.request(|reply| Command::Transmit {
            payload,
            recipient,
            reply,
        })
        .await?
    }

    /// Announce this peer as master.
    pub async fn announce_master(&self) -> Result<()> {
        self.request(Command::AnnounceMaster).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    /// Send a `stop` notice if connected, unsubscribe, and end the client task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// Event loop state for one identity over one transport.
pub struct Client<T: BroadcastTransport> {
    config: ClientConfig,
    transport: T,
    protocol: Protocol,
    connection: ConnectionState,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    last_status: ConnectionStatus,
    /// Drives cooldown ticks. Restarted whenever a cooldown is armed so the
    /// first decrement lands a full period later.
    cooldown_clock: Interval,
}

impl<T: BroadcastTransport + 'static> Client<T> {
    /// Spawn a client with a freshly generated identity.
    pub fn spawn(
        config: ClientConfig,
        transport: T,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::spawn_with_identity(config, Identity::generate(), transport)
    }

    pub fn spawn_with_identity(
        config: ClientConfig,
        identity: Identity,
        transport: T,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handle = ClientHandle {
            commands: command_tx,
            user_id: identity.user_id().to_string(),
            public_key: identity.public_key(),
        };
        let period = if config.tick_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            config.tick_interval
        };
        let mut cooldown_clock = interval_at(Instant::now() + period, period);
        cooldown_clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let client = Client {
            connection: ConnectionState::new(config.login_failure_cooldown_secs),
            config,
            transport,
            protocol: Protocol::new(identity),
            transport_events: None,
            events: event_tx,
            last_status: ConnectionStatus::NotConnected,
            cooldown_clock,
        };
        tokio::spawn(client.run(command_rx));

        (handle, event_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(user_id = %self.protocol.user_id(), "client started");

        loop {
            tokio::select! {
                event = next_transport_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        debug!("transport event stream closed");
                        self.transport_events = None;
                    }
                },
                _ = self.cooldown_clock.tick() => self.on_tick(),
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.on_command(command).await,
                        None => {
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Transmit {
                payload,
                recipient,
                reply,
            } => {
                let result = self.transmit(&payload, recipient).await;
                let _ = reply.send(result);
            }
            Command::AnnounceMaster(reply) => {
                let result = self.announce_master().await;
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) -> Result<()> {
        self.config.validate()?;
        self.connection.begin_connect()?;

        self.transport_events = Some(self.transport.subscribe());
        self.publish_status();

        info!(
            user_id = %self.protocol.user_id(),
            channel = %self.config.channel_id,
            "logging in"
        );
        if let Err(e) = self.transport.login(&self.config.credentials).await {
            warn!(
                error = %e,
                cooldown_secs = self.config.login_failure_cooldown_secs,
                "login failed, backing off"
            );
            if self.connection.on_login_failed() {
                self.cooldown_clock.reset();
            }
            self.publish_status();
            return Err(e);
        }
        Ok(())
    }

    async fn transmit(&mut self, payload: &Value, recipient: Option<[u8; KEY_SIZE]>) -> Result<()> {
        if self.connection.channel().is_none() {
            return Err(ChannelBoxError::StateError("not connected".to_string()));
        }
        let envelope = self.protocol.seal_transmit(payload, recipient)?;
        self.send(&envelope).await
    }

    async fn announce_master(&mut self) -> Result<()> {
        if self.connection.channel().is_none() {
            return Err(ChannelBoxError::StateError("not connected".to_string()));
        }
        let envelope = self.protocol.announce_master();
        self.send(&envelope).await
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            user_id: self.protocol.user_id().to_string(),
            known_peers: self.protocol.peers().user_ids(),
            master_key: self.protocol.master_key(),
            is_master: self.protocol.is_master(),
            can_announce_master: self.protocol.can_announce_master(),
            status: self.connection.status(),
            stats: self.protocol.stats(),
        }
    }

    async fn shutdown(&mut self) {
        if self.connection.channel().is_some() {
            let notice = self.protocol.stop_notice();
            if let Err(e) = self.send(&notice).await {
                debug!(error = %e, "stop notice not sent");
            }
        }
        self.transport.unsubscribe().await;
        self.transport_events = None;
        self.connection.release();
        self.publish_status();
        info!(user_id = %self.protocol.user_id(), "client stopped");
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => self.on_ready().await,
            TransportEvent::Message(text) => self.on_message(&text).await,
            TransportEvent::RateLimited { timeout_ms } => {
                warn!(timeout_ms, "rate limited by transport");
                if self.connection.on_rate_limited(timeout_ms) {
                    self.cooldown_clock.reset();
                }
                self.publish_status();
            }
            TransportEvent::Invalidated => warn!("transport session invalidated"),
        }
    }

    async fn on_ready(&mut self) {
        if self.connection.channel().is_some() {
            debug!("ready while already connected");
            return;
        }

        match self.transport.fetch_channel(&self.config.channel_id).await {
            Ok(channel) => {
                info!(channel = %channel.id(), "channel joined");
                self.connection.on_connected(channel);

                let request = self.protocol.handshake_request();
                if let Err(e) = self.send(&request).await {
                    warn!(error = %e, "handshake request not sent");
                }
                self.publish_status();
            }
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %self.config.channel_id,
                    "channel fetch failed, backing off"
                );
                if self.connection.on_login_failed() {
                    self.cooldown_clock.reset();
                }
                self.publish_status();
            }
        }
    }

    async fn on_message(&mut self, text: &str) {
        let reaction = self.protocol.handle_text(text);
        if let Some(reply) = reaction.reply {
            if let Err(e) = self.send(&reply).await {
                warn!(error = %e, action = %reply.action, "reply not sent");
            }
        }
        if let Some(event) = reaction.event {
            self.emit(event);
        }
    }

    fn on_tick(&mut self) {
        if self.connection.tick() {
            info!("cooldown expired, connecting is allowed again");
        }
        self.publish_status();
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let channel = self
            .connection
            .channel()
            .ok_or_else(|| ChannelBoxError::StateError("not connected".to_string()))?;
        let text = envelope.to_json()?;
        debug!(action = %envelope.action, to = ?envelope.to_user_id, "sending envelope");
        self.transport.send(channel, text).await
    }

    fn publish_status(&mut self) {
        let status = self.connection.status();
        if status != self.last_status {
            self.last_status = status;
            self.emit(SessionEvent::Connection(status));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHub, MemoryTransport};
    use crate::transport::{ChannelHandle, Credentials};
    use serde_json::json;

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_connect_requires_config() {
        let hub = MemoryHub::new();
        let (handle, _events) = Client::spawn(ClientConfig::new("token", ""), hub.transport());

        let result = handle.connect().await;
        assert!(matches!(result, Err(ChannelBoxError::ConfigError(_))));
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::NotConnected
        );
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let hub = MemoryHub::new();
        let (handle, _events) = Client::spawn(ClientConfig::new("token", "general"), hub.transport());

        assert!(matches!(
            handle.transmit(&json!({"test": true}), Some([1u8; 32])).await,
            Err(ChannelBoxError::StateError(_))
        ));
        assert!(matches!(
            handle.announce_master().await,
            Err(ChannelBoxError::StateError(_))
        ));
        assert!(handle.snapshot().await.unwrap().can_announce_master);
    }

    #[tokio::test]
    async fn test_connect_broadcasts_handshake_request() {
        let hub = MemoryHub::new();
        hub.create_channel("general");
        let (handle, mut events) =
            Client::spawn(ClientConfig::new("token", "general"), hub.transport());

        handle.connect().await.unwrap();
        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::Connected)
        })
        .await;

        let history = hub.history("general");
        assert_eq!(history.len(), 1);
        let request = Envelope::parse(&history[0]).unwrap();
        assert_eq!(request.action, crate::envelope::Action::HandshakeRequest);
        assert_eq!(request.from_user_id, handle.user_id());
        assert_eq!(request.announced_key().unwrap(), handle.public_key());

        assert!(matches!(
            handle.connect().await,
            Err(ChannelBoxError::StateError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_failure_backs_off_then_unlocks() {
        let hub = MemoryHub::with_token("right");
        hub.create_channel("general");
        let config = ClientConfig::new("wrong", "general").with_login_failure_cooldown(3);
        let (handle, mut events) = Client::spawn(config, hub.transport());

        assert!(matches!(
            handle.connect().await,
            Err(ChannelBoxError::TransportError(_))
        ));
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::RetryAfter(3)
        );
        assert!(matches!(
            handle.connect().await,
            Err(ChannelBoxError::StateError(_))
        ));

        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::NotConnected)
        })
        .await;
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::NotConnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_channel_backs_off() {
        let hub = MemoryHub::new();
        let config = ClientConfig::new("token", "nowhere").with_login_failure_cooldown(10);
        let (handle, mut events) = Client::spawn(config, hub.transport());

        handle.connect().await.unwrap();
        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::RetryAfter(10))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_while_connected_keeps_channel() {
        let hub = MemoryHub::new();
        hub.create_channel("general");
        let (handle, mut events) =
            Client::spawn(ClientConfig::new("token", "general"), hub.transport());

        handle.connect().await.unwrap();
        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::Connected)
        })
        .await;

        hub.rate_limit_all(2500);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);

        handle
            .transmit(&json!("still here"), Some(handle.public_key()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let hub = MemoryHub::new();
        hub.create_channel("general");
        let (handle, mut events) =
            Client::spawn(ClientConfig::new("token", "general"), hub.transport());

        handle.connect().await.unwrap();
        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::Connected)
        })
        .await;

        handle.shutdown().await.unwrap();
        let last = Envelope::parse(hub.history("general").last().unwrap()).unwrap();
        assert_eq!(last.action, crate::envelope::Action::Stop);

        assert!(handle.snapshot().await.is_err());
    }

    /// Accepts any login but never reports ready, so the client stays
    /// `Connecting` until something else happens.
    struct NeverReady(MemoryTransport);

    #[async_trait::async_trait]
    impl BroadcastTransport for NeverReady {
        async fn login(&self, _credentials: &Credentials) -> Result<()> {
            Ok(())
        }

        async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelHandle> {
            self.0.fetch_channel(channel_id).await
        }

        async fn send(&self, channel: &ChannelHandle, text: String) -> Result<()> {
            self.0.send(channel, text).await
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
            self.0.subscribe()
        }

        async fn unsubscribe(&self) {
            self.0.unsubscribe().await
        }
    }

    async fn wait_for_status(handle: &ClientHandle, wanted: ConnectionStatus) {
        while handle.snapshot().await.unwrap().status != wanted {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_holds_lock_for_full_timeout() {
        let hub = MemoryHub::new();
        hub.create_channel("general");
        let transport = hub.transport();
        let injector = transport.clone();
        let (handle, _events) = Client::spawn(
            ClientConfig::new("token", "general"),
            NeverReady(transport),
        );

        // Arm the cooldown partway through a clock period.
        tokio::time::sleep(Duration::from_millis(900)).await;
        handle.connect().await.unwrap();
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::Connecting
        );

        assert!(injector.inject(TransportEvent::RateLimited { timeout_ms: 5000 }));
        let armed_at = Instant::now();
        wait_for_status(&handle, ConnectionStatus::RetryAfter(5)).await;

        tokio::time::sleep_until(armed_at + Duration::from_millis(4900)).await;
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::RetryAfter(1)
        );
        assert!(matches!(
            handle.connect().await,
            Err(ChannelBoxError::StateError(_))
        ));

        tokio::time::sleep_until(armed_at + Duration::from_millis(5010)).await;
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::NotConnected
        );
        handle.connect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_cooldown_counts_from_failure() {
        let hub = MemoryHub::new();
        let config = ClientConfig::new("token", "nowhere").with_login_failure_cooldown(1);
        let (handle, mut events) = Client::spawn(config, hub.transport());

        tokio::time::sleep(Duration::from_millis(900)).await;
        handle.connect().await.unwrap();
        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::RetryAfter(1))
        })
        .await;
        let armed_at = Instant::now();

        wait_for(&mut events, |e| {
            *e == SessionEvent::Connection(ConnectionStatus::NotConnected)
        })
        .await;
        assert!(
            armed_at.elapsed() >= Duration::from_secs(1),
            "released after {:?}",
            armed_at.elapsed()
        );
    }

    #[tokio::test]
    async fn test_zero_login_cooldown_is_rejected() {
        let hub = MemoryHub::with_token("right");
        hub.create_channel("general");
        let config = ClientConfig::new("wrong", "general").with_login_failure_cooldown(0);
        let (handle, _events) = Client::spawn(config, hub.transport());

        assert!(matches!(
            handle.connect().await,
            Err(ChannelBoxError::ConfigError(_))
        ));
        assert_eq!(
            handle.snapshot().await.unwrap().status,
            ConnectionStatus::NotConnected
        );
    }
}
