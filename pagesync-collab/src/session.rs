//! Collaboration session: the page document shared with every editor of
//! the same document id.
//!
//! ```text
//!   editor ──set_data/update_data──► CollaborationEngine (local replica)
//!                                           │ update
//!                                           ▼
//!                                    command channel ──► pump task ──► SyncClient ──► relay
//!                                                          ▲
//!   on_remote_update ◄── engine ◄── RemoteDelta/StateSynced┘
//! ```
//!
//! Local edits apply to the replica synchronously and never fail toward
//! the caller; the network catches up whenever it is connected. Network
//! trouble is visible only through the connection status.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use pagesync_core::collab::{CollaborationEngine, DEFAULT_UNDO_LIMIT};
use pagesync_core::{PageDocument, PartialPageDocument};

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::{AwarenessMessage, AwarenessSnapshot, PresenceRoom, User, Vec2};
use crate::subscription::{Listeners, Subscription};

/// Reconnect timing after the transport drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub document_id: String,
    /// WebSocket URL of the relay, e.g. `ws://127.0.0.1:9090`
    pub transport_url: String,
    pub local_user: User,
    pub reconnect: ReconnectPolicy,
    pub undo_limit: usize,
    /// Ping and presence keepalive period
    pub heartbeat_interval: Duration,
}

impl SessionConfig {
    pub fn new(document_id: impl Into<String>, transport_url: impl Into<String>, local_user: User) -> Self {
        Self {
            document_id: document_id.into(),
            transport_url: transport_url.into(),
            local_user,
            reconnect: ReconnectPolicy::default(),
            undo_limit: DEFAULT_UNDO_LIMIT,
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    /// Peers silent for three heartbeats are dropped from presence; they
    /// re-announce themselves every heartbeat while connected.
    pub fn presence_idle_timeout(&self) -> Duration {
        self.heartbeat_interval.max(Duration::from_millis(1)) * 3
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// `open` was called outside a tokio runtime.
    NoRuntime,
    /// The sync client's event stream was already claimed.
    EventStreamTaken,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRuntime => write!(f, "collaboration session requires a tokio runtime"),
            Self::EventStreamTaken => write!(f, "sync client event stream already taken"),
        }
    }
}

impl std::error::Error for SessionError {}

type RemoteUpdateFn = Box<dyn Fn(&PageDocument) + Send + Sync>;

enum Command {
    Delta(Vec<u8>),
    Presence(AwarenessMessage),
    Shutdown,
}

/// State shared between the session handle and its pump task.
struct Shared {
    engine: Mutex<CollaborationEngine>,
    presence: Mutex<PresenceRoom>,
    status: Mutex<ConnectionState>,
    awareness_listeners: Listeners<AwarenessSnapshot>,
    connection_listeners: Listeners<ConnectionState>,
    on_remote_update: RemoteUpdateFn,
}

impl Shared {
    fn engine(&self) -> MutexGuard<'_, CollaborationEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence(&self) -> MutexGuard<'_, PresenceRoom> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> ConnectionState {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, next: ConnectionState) {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == next {
                return;
            }
            log::debug!("connection status {:?} -> {next:?}", *status);
            *status = next;
        }
        self.connection_listeners.emit(&next);
    }

    fn notify_awareness(&self) {
        let snapshot = self.presence().snapshot();
        self.awareness_listeners.emit(&snapshot);
    }

    /// Merges a remote update and reports the resulting document, unless
    /// the update brought nothing new or there is no data yet.
    fn apply_remote(&self, update: &[u8]) {
        let data = {
            let mut engine = self.engine();
            let before = engine.state_vector();
            if let Err(e) = engine.apply_remote_update(update) {
                log::warn!("Discarding remote update: {e}");
                return;
            }
            if engine.state_vector() == before {
                return;
            }
            match engine.get_data() {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Shared page holds unreadable data: {e}");
                    None
                }
            }
        };
        if let Some(doc) = data {
            (self.on_remote_update)(&doc);
        }
    }
}

/// A live connection to one shared page document.
pub struct CollaborationSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    pump: JoinHandle<()>,
    client_id: Uuid,
    document_id: String,
}

impl CollaborationSession {
    /// Opens the session and starts connecting in the background. Must be
    /// called within a tokio runtime.
    ///
    /// `on_remote_update` receives the full document after every remote
    /// change, once the document has data.
    pub fn open<F>(config: SessionConfig, on_remote_update: F) -> Result<Self, SessionError>
    where
        F: Fn(&PageDocument) + Send + Sync + 'static,
    {
        let handle = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let client_id = Uuid::new_v4();
        let mut client = SyncClient::new(
            client_id,
            config.local_user.clone(),
            config.document_id.clone(),
            config.transport_url.clone(),
        );
        let events = client.take_event_rx().ok_or(SessionError::EventStreamTaken)?;

        let shared = Arc::new(Shared {
            engine: Mutex::new(CollaborationEngine::with_undo_limit(config.undo_limit)),
            presence: Mutex::new(
                PresenceRoom::new(client_id, config.local_user.clone())
                    .with_idle_timeout(config.presence_idle_timeout()),
            ),
            status: Mutex::new(ConnectionState::Connecting),
            awareness_listeners: Listeners::new(),
            connection_listeners: Listeners::new(),
            on_remote_update: Box::new(on_remote_update),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let pump = Pump {
            shared: shared.clone(),
            client,
            events,
            commands: command_rx,
            reconnect: config.reconnect,
            heartbeat_interval: config.heartbeat_interval.max(Duration::from_millis(1)),
            attempt: 0,
            retry_at: None,
        };

        log::info!("Opening collaboration session {client_id} for {}", config.document_id);
        let pump = handle.spawn(pump.run());

        Ok(Self {
            shared,
            commands,
            pump,
            client_id,
            document_id: config.document_id,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn publish(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("session pump has stopped; change stays local");
        }
    }

    // ---------------------------------------------------------------
    // Document
    // ---------------------------------------------------------------

    /// Replaces the whole document. Remote peers see all three keys in
    /// one update.
    pub fn set_data(&self, data: &PageDocument) {
        let result = self.shared.engine().set_data(data);
        match result {
            Ok(Some(update)) => self.publish(Command::Delta(update)),
            Ok(None) => {}
            Err(e) => log::error!("set_data failed: {e}"),
        }
    }

    /// `None` until someone has written the document.
    pub fn get_data(&self) -> Option<PageDocument> {
        match self.shared.engine().get_data() {
            Ok(data) => data,
            Err(e) => {
                log::error!("get_data failed: {e}");
                None
            }
        }
    }

    pub fn update_data(&self, partial: &PartialPageDocument) {
        let result = self.shared.engine().update_data(partial);
        match result {
            Ok(Some(update)) => self.publish(Command::Delta(update)),
            Ok(None) => {}
            Err(e) => log::error!("update_data failed: {e}"),
        }
    }

    // ---------------------------------------------------------------
    // Undo / redo (local edits only)
    // ---------------------------------------------------------------

    pub fn undo(&self) -> bool {
        let update = self.shared.engine().undo();
        match update {
            Some(update) => {
                self.publish(Command::Delta(update));
                true
            }
            None => false,
        }
    }

    pub fn redo(&self) -> bool {
        let update = self.shared.engine().redo();
        match update {
            Some(update) => {
                self.publish(Command::Delta(update));
                true
            }
            None => false,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.shared.engine().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.shared.engine().can_redo()
    }

    // ---------------------------------------------------------------
    // Presence
    // ---------------------------------------------------------------

    /// Publishes the local pointer; `None` hides it.
    pub fn update_cursor(&self, position: Option<Vec2>) {
        let msg = self.shared.presence().update_local_cursor(position);
        self.publish(Command::Presence(msg));
        self.shared.notify_awareness();
    }

    pub fn get_awareness(&self) -> AwarenessSnapshot {
        self.shared.presence().snapshot()
    }

    /// Calls `listener` with the current snapshot before returning, then
    /// on every presence change.
    pub fn on_awareness_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AwarenessSnapshot) + Send + Sync + 'static,
    {
        listener(&self.get_awareness());
        self.shared.awareness_listeners.subscribe(listener)
    }

    // ---------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------

    pub fn connection_status(&self) -> ConnectionState {
        self.shared.status()
    }

    /// Calls `listener` with the current status before returning, then on
    /// every transition.
    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        listener(&self.connection_status());
        self.shared.connection_listeners.subscribe(listener)
    }

    /// Announces the leave, closes the transport and waits for the
    /// background task to finish.
    pub async fn destroy(self) {
        let Self {
            commands,
            pump,
            client_id,
            ..
        } = self;
        let _ = commands.send(Command::Shutdown);
        drop(commands);
        if let Err(e) = pump.await {
            log::warn!("session {client_id} pump ended abnormally: {e}");
        }
        log::info!("Closed collaboration session {client_id}");
    }
}

/// Background task owning the transport.
struct Pump {
    shared: Arc<Shared>,
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    reconnect: ReconnectPolicy,
    heartbeat_interval: Duration,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl Pump {
    async fn run(mut self) {
        self.try_connect().await;

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Delta(update)) => {
                        if let Err(e) = self.client.send_delta(update).await {
                            log::warn!("Failed to send update: {e}");
                        }
                    }
                    Some(Command::Presence(msg)) => {
                        if let Err(e) = self.client.send_presence(&msg).await {
                            log::debug!("Failed to send presence: {e}");
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },

                Some(event) = self.events.recv() => self.handle_event(event).await,

                _ = async move {
                    match retry_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.retry_at = None;
                    self.try_connect().await;
                }

                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        self.shutdown().await;
    }

    async fn try_connect(&mut self) {
        match self.client.connect().await {
            Ok(()) => self.attempt = 0,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.client.server_url());
                self.shared.set_status(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if !self.reconnect.allows(self.attempt) {
            log::error!(
                "Giving up on {} after {} attempts",
                self.client.server_url(),
                self.attempt
            );
            return;
        }
        let delay = self.reconnect.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        log::debug!("Reconnecting in {delay:?} (attempt {})", self.attempt);
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {
                self.shared.set_status(ConnectionState::Connected);

                let state_vector = self.shared.engine().state_vector();
                if let Err(e) = self.client.send_sync_step1(state_vector).await {
                    log::warn!("Failed to request sync: {e}");
                }

                let (join, cursor) = {
                    let mut presence = self.shared.presence();
                    (presence.join_message(), presence.local_cursor_message())
                };
                for msg in [join, cursor] {
                    if let Err(e) = self.client.send_presence(&msg).await {
                        log::debug!("Failed to announce presence: {e}");
                    }
                }
            }

            SyncEvent::Disconnected => {
                self.shared.set_status(ConnectionState::Disconnected);
                let had_peers = self.shared.presence().clear_peers();
                if had_peers {
                    self.shared.notify_awareness();
                }
                if self.retry_at.is_none() {
                    self.schedule_retry();
                }
            }

            SyncEvent::RemoteDelta { update, .. } | SyncEvent::StateSynced(update) => {
                self.shared.apply_remote(&update);
            }

            SyncEvent::SyncRequested(state_vector) => {
                let diff = self.shared.engine().encode_diff(&state_vector);
                match diff {
                    Ok(diff) => {
                        if let Err(e) = self.client.send_sync_step2(diff).await {
                            log::warn!("Failed to answer sync request: {e}");
                        }
                    }
                    Err(e) => log::warn!("Bad state vector from relay: {e}"),
                }
            }

            SyncEvent::RemotePresence(msg) => {
                let changed = self.shared.presence().handle_message(&msg);
                if changed {
                    self.shared.notify_awareness();
                }
            }

            SyncEvent::PeerJoined { client_id, user } => {
                let changed = self
                    .shared
                    .presence()
                    .handle_message(&AwarenessMessage::Join { client_id, user });
                if changed {
                    self.shared.notify_awareness();
                }
            }

            SyncEvent::PeerLeft(client_id) => {
                let changed = self.shared.presence().remove_peer(&client_id);
                if changed {
                    self.shared.notify_awareness();
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        if self.client.connection_state().await != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.client.send_ping().await {
            log::debug!("Ping failed: {e}");
        }
        let join = self.shared.presence().join_message();
        if let Err(e) = self.client.send_presence(&join).await {
            log::debug!("Presence keepalive failed: {e}");
        }

        let removed = self.shared.presence().cleanup_idle_peers();
        if !removed.is_empty() {
            log::debug!("Dropped {} idle peers", removed.len());
            self.shared.notify_awareness();
        }
    }

    async fn shutdown(&mut self) {
        if self.client.connection_state().await == ConnectionState::Connected {
            let leave = self.shared.presence().leave_message();
            if let Err(e) = self.client.send_presence(&leave).await {
                log::debug!("Failed to announce leave: {e}");
            }
        }
        self.client.disconnect().await;
    }
}
