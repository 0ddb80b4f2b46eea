//! Channel manager: supervisor of the single live streaming connection.
//!
//! Implemented as an actor task, so connect, heartbeat, reconnect and
//! destroy cannot interleave: every transition runs to completion inside
//! one select loop. The handle side ([`ChannelManager`]) only sends
//! commands and reads a shared status snapshot.
//!
//! Reconnection uses capped exponential backoff with uniform jitter, and
//! rotates to the next endpoint in priority order once the attempt
//! counter passes two. On every successful (re)connect, the whole
//! registry is re-installed on the new transport and stale remote
//! handles are discarded.

use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::clock::{Clock, MonotonicClock};
use crate::endpoint::EndpointConfig;
use crate::error::RpcError;
use crate::events::{ChannelEvent, EventBus};
use crate::subscription::debounce::SlotDebouncer;
use crate::subscription::registry::{SubscriptionId, SubscriptionRegistry};
use crate::transport::{StreamConnector, StreamNotification, StreamingChannel};
use crate::types::{Commitment, NotificationPayload};

/// Exponent cap for the reconnect backoff (2^10 × base at most).
const MAX_BACKOFF_EXPONENT: u32 = 10;
/// Consecutive attempts before rotating to the next endpoint.
const ROTATE_AFTER_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Snapshot of the channel manager's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// URL of the endpoint currently (or last) dialed.
    pub endpoint: Option<String>,
    pub reconnect_attempts: u32,
    pub connected_since_millis: Option<u64>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Disconnected,
            endpoint: None,
            reconnect_attempts: 0,
            connected_since_millis: None,
        }
    }
}

/// Timing knobs handed down from the subscription config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTuning {
    pub commitment: Commitment,
    pub heartbeat_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

enum Command {
    Connect { reply: oneshot::Sender<Result<(), RpcError>> },
    Install { id: SubscriptionId },
    Remove { remote_id: Option<u64> },
    RequestRecovery,
    Destroy,
}

/// Handle to the channel actor.
#[derive(Clone)]
pub struct ChannelManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<ChannelStatus>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager").field("status", &self.status()).finish()
    }
}

impl ChannelManager {
    /// Spawn the actor. `endpoints` must be non-empty and sorted by
    /// priority (the config layer guarantees both).
    pub(crate) fn spawn(
        endpoints: Vec<EndpointConfig>,
        connector: Arc<dyn StreamConnector>,
        registry: Arc<Mutex<SubscriptionRegistry>>,
        debouncer: SlotDebouncer,
        events: EventBus,
        tuning: ChannelTuning,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(ChannelStatus::default()));

        let actor = ChannelActor {
            endpoints,
            connector,
            registry,
            debouncer,
            events,
            tuning,
            status: Arc::clone(&status),
            clock: Arc::new(MonotonicClock::default()),
            cmd_rx,
            channel: None,
            notif_rx: None,
            current_endpoint: 0,
            attempts: 0,
            destroyed: false,
            heartbeat_at: None,
            reconnect_at: None,
        };
        tokio::spawn(actor.run());

        Self { cmd_tx, status }
    }

    /// Open the channel at the current-priority endpoint.
    ///
    /// Refuses when already connecting, connected, or destroyed. A failure
    /// is surfaced to the caller after the error event is emitted.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let (reply, response) = oneshot::channel();
        if self.cmd_tx.send(Command::Connect { reply }).is_err() {
            return Err(RpcError::validation("channel manager destroyed"));
        }
        response
            .await
            .unwrap_or_else(|_| Err(RpcError::validation("channel manager destroyed")))
    }

    /// Ask the actor to install subscription `id` on the live transport.
    pub(crate) fn install(&self, id: SubscriptionId) {
        let _ = self.cmd_tx.send(Command::Install { id });
    }

    /// Best-effort removal of a remote subscription.
    pub(crate) fn remove_remote(&self, remote_id: Option<u64>) {
        let _ = self.cmd_tx.send(Command::Remove { remote_id });
    }

    /// Nudge a reconnect attempt (used by the polling fallback's recovery
    /// cadence). No-op while connected.
    pub(crate) fn request_recovery(&self) {
        let _ = self.cmd_tx.send(Command::RequestRecovery);
    }

    /// Permanent teardown; later connects and reconnects are no-ops.
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }

    pub fn state(&self) -> ChannelState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct ChannelActor {
    endpoints: Vec<EndpointConfig>,
    connector: Arc<dyn StreamConnector>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    debouncer: SlotDebouncer,
    events: EventBus,
    tuning: ChannelTuning,
    status: Arc<Mutex<ChannelStatus>>,
    clock: Arc<dyn Clock>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    channel: Option<Box<dyn StreamingChannel>>,
    notif_rx: Option<mpsc::UnboundedReceiver<StreamNotification>>,
    current_endpoint: usize,
    attempts: u32,
    destroyed: bool,
    heartbeat_at: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            if self.destroyed {
                break;
            }
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                notification = Self::next_notification(&mut self.notif_rx) => {
                    match notification {
                        Some(notification) => self.dispatch(notification).await,
                        None => self.handle_stream_loss().await,
                    }
                }
                _ = Self::sleep_until(deadline) => self.handle_timers().await,
            }
        }
        self.teardown().await;
    }

    async fn next_notification(
        rx: &mut Option<mpsc::UnboundedReceiver<StreamNotification>>,
    ) -> Option<StreamNotification> {
        match rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_until(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.heartbeat_at, self.reconnect_at) {
            (Some(h), Some(r)) => Some(h.min(r)),
            (h, r) => h.or(r),
        }
    }

    fn state(&self) -> ChannelState {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    fn update_status(&self, f: impl FnOnce(&mut ChannelStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                if self.destroyed {
                    let _ = reply.send(Err(RpcError::validation("channel manager destroyed")));
                    return;
                }
                match self.state() {
                    ChannelState::Connecting | ChannelState::Connected => {
                        let state = self.state();
                        let _ = reply.send(Err(RpcError::validation(format!(
                            "connect refused: channel is already {}",
                            state
                        ))));
                    }
                    ChannelState::Disconnected | ChannelState::Reconnecting => {
                        self.reconnect_at = None;
                        self.try_connect(Some(reply)).await;
                    }
                }
            }
            Command::Install { id } => self.install(id).await,
            Command::Remove { remote_id } => {
                if let (Some(channel), Some(remote)) = (&self.channel, remote_id) {
                    if let Err(error) = channel.unsubscribe(remote).await {
                        tracing::debug!(remote, error = %error, "remote unsubscribe failed");
                    }
                }
            }
            Command::RequestRecovery => {
                if !self.destroyed
                    && matches!(
                        self.state(),
                        ChannelState::Disconnected | ChannelState::Reconnecting
                    )
                {
                    self.reconnect_at = None;
                    self.try_connect(None).await;
                }
            }
            Command::Destroy => {
                self.destroyed = true;
            }
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                self.try_connect(None).await;
            }
        }
        if let Some(at) = self.heartbeat_at {
            if now >= at {
                self.heartbeat_at = None;
                self.heartbeat().await;
            }
        }
    }

    async fn try_connect(&mut self, reply: Option<oneshot::Sender<Result<(), RpcError>>>) {
        let was_reconnecting = self.state() == ChannelState::Reconnecting;
        let endpoint = self.endpoints[self.current_endpoint].clone();
        let url = endpoint.stream_url().to_string();

        self.update_status(|status| {
            status.state = ChannelState::Connecting;
            status.endpoint = Some(url.clone());
        });
        tracing::info!(url, "opening streaming channel");

        let connected = async {
            let channel = self.connector.connect(&url).await?;
            // Liveness check before declaring the channel usable.
            channel.ping().await?;
            Ok::<_, RpcError>(channel)
        }
        .await;

        match connected {
            Ok(mut channel) => {
                self.notif_rx = channel.notifications();
                self.channel = Some(channel);
                self.attempts = 0;
                self.reconnect_at = None;
                self.heartbeat_at = Some(Instant::now() + self.tuning.heartbeat_interval);

                let now = self.clock.now_millis();
                self.update_status(|status| {
                    status.state = ChannelState::Connected;
                    status.reconnect_attempts = 0;
                    status.connected_since_millis = Some(now);
                });

                self.resubscribe_all().await;
                self.events.emit(ChannelEvent::Connected { endpoint: url });
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(error) => {
                tracing::warn!(url, error = %error, "streaming connect failed");
                self.update_status(|status| status.state = ChannelState::Disconnected);
                self.events.emit(ChannelEvent::ChannelError { message: error.to_string() });
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(error));
                        if was_reconnecting {
                            self.schedule_reconnect();
                        }
                    }
                    None => self.schedule_reconnect(),
                }
            }
        }
    }

    async fn install(&mut self, id: SubscriptionId) {
        let params = self.lock_registry().get(id).map(|entry| entry.params.clone());
        let Some(params) = params else { return };
        let Some(channel) = &self.channel else {
            // Not connected: the entry is installed by the next
            // resubscription sweep.
            return;
        };

        match channel.subscribe(&params, self.tuning.commitment).await {
            Ok(remote) => {
                let removed_meanwhile = {
                    let mut registry = self.lock_registry();
                    if registry.contains(id) {
                        registry.set_remote(id, Some(remote));
                        false
                    } else {
                        true
                    }
                };
                if removed_meanwhile {
                    if let Some(channel) = &self.channel {
                        let _ = channel.unsubscribe(remote).await;
                    }
                }
            }
            Err(error) => {
                tracing::warn!(id, error = %error, "failed to install subscription");
                self.events.emit(ChannelEvent::ChannelError { message: error.to_string() });
            }
        }
    }

    async fn resubscribe_all(&mut self) {
        let entries = self.lock_registry().entries();
        for entry in entries {
            let Some(channel) = &self.channel else { break };
            match channel.subscribe(&entry.params, self.tuning.commitment).await {
                Ok(remote) => {
                    self.lock_registry().set_remote(entry.id, Some(remote));
                }
                Err(error) => {
                    tracing::warn!(
                        id = entry.id,
                        kind = entry.params.kind(),
                        error = %error,
                        "resubscription failed"
                    );
                    self.events.emit(ChannelEvent::ChannelError { message: error.to_string() });
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        let Some(channel) = &self.channel else { return };
        match channel.ping().await {
            Ok(()) => {
                tracing::trace!("heartbeat ok");
                self.heartbeat_at = Some(Instant::now() + self.tuning.heartbeat_interval);
            }
            Err(error) => {
                tracing::warn!(error = %error, "heartbeat failed, reconnecting");
                self.events.emit(ChannelEvent::Disconnected {
                    reason: format!("heartbeat failed: {}", error),
                    was_clean: false,
                });
                self.handle_channel_loss().await;
            }
        }
    }

    async fn handle_stream_loss(&mut self) {
        if self.channel.is_none() {
            self.notif_rx = None;
            return;
        }
        self.events.emit(ChannelEvent::Disconnected {
            reason: "notification stream closed".to_string(),
            was_clean: false,
        });
        self.handle_channel_loss().await;
    }

    async fn handle_channel_loss(&mut self) {
        self.best_effort_unsubscribe().await;
        self.channel = None;
        self.notif_rx = None;
        self.heartbeat_at = None;
        self.lock_registry().clear_remote_ids();
        self.schedule_reconnect();
    }

    async fn best_effort_unsubscribe(&mut self) {
        let Some(channel) = &self.channel else { return };
        let remotes: Vec<u64> =
            self.lock_registry().entries().iter().filter_map(|e| e.remote_id).collect();
        for remote in remotes {
            if let Err(error) = channel.unsubscribe(remote).await {
                tracing::debug!(remote, error = %error, "remote unsubscribe failed");
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.destroyed {
            return;
        }
        self.attempts += 1;

        let base_ms = self.tuning.reconnect_base.as_millis() as u64;
        let max_ms = self.tuning.reconnect_max.as_millis() as u64;
        let exponent = self.attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let backoff_ms = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
        let jitter_ms =
            if base_ms > 0 { rand::rng().random_range(0..base_ms) } else { 0 };
        let delay = Duration::from_millis(backoff_ms + jitter_ms);

        if self.attempts > ROTATE_AFTER_ATTEMPTS && self.endpoints.len() > 1 {
            self.current_endpoint = (self.current_endpoint + 1) % self.endpoints.len();
            tracing::info!(
                url = %self.endpoints[self.current_endpoint].stream_url(),
                "rotating to next streaming endpoint"
            );
        }

        let attempts = self.attempts;
        self.update_status(|status| {
            status.state = ChannelState::Reconnecting;
            status.reconnect_attempts = attempts;
            status.connected_since_millis = None;
        });
        self.events.emit(ChannelEvent::Reconnecting {
            attempt: attempts,
            delay_ms: delay.as_millis() as u64,
        });
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn dispatch(&mut self, notification: StreamNotification) {
        match notification.payload {
            // Slot notifications share one debounce window across every
            // slot subscriber.
            NotificationPayload::Slot(info) => self.debouncer.offer(info),
            payload => {
                let entry = self.lock_registry().find_by_remote(notification.remote_id).cloned();
                let Some(entry) = entry else {
                    tracing::debug!(
                        remote = notification.remote_id,
                        "dropping notification for unknown remote id"
                    );
                    return;
                };

                // Signature subscriptions are one-shot: remove the entry
                // before invoking the callback so a second delivery is
                // impossible.
                if matches!(payload, NotificationPayload::Signature(_)) {
                    self.lock_registry().remove(entry.id);
                }

                if let Err(error) = (entry.callback)(&payload) {
                    tracing::warn!(id = entry.id, error = %error, "subscription callback failed");
                }

                if matches!(payload, NotificationPayload::Signature(_)) {
                    if let Some(channel) = &self.channel {
                        let _ = channel.unsubscribe(notification.remote_id).await;
                    }
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.best_effort_unsubscribe().await;
        self.channel = None;
        self.notif_rx = None;
        self.heartbeat_at = None;
        self.reconnect_at = None;
        self.debouncer.shutdown();
        self.update_status(|status| {
            status.state = ChannelState::Disconnected;
            status.connected_since_millis = None;
        });
        tracing::info!("channel manager destroyed");
    }
}
