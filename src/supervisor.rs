// ABOUTME: Connection supervisor owning the single gateway session.
// ABOUTME: Connect, heartbeat, reconnect with backoff, dispatch routing, graceful shutdown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffConfig, BackoffState};
use crate::config::Config;
use crate::events::LogEvent;
use crate::gateway::{ConnectError, GatewayConnection, GatewayTransport, TransportEvent};
use crate::manager::ExtensionManager;
use crate::metrics;
use crate::sink::SinkHandle;

/// Lifecycle states of the gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: auth rejection or retry budget exhausted
    Failed,
}

/// The single active gateway session. Owned and mutated exclusively by the
/// supervisor; everyone else sees read-only snapshots.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: ConnectionState,
    pub last_heartbeat_ack: Option<Instant>,
    pub reconnect_attempts: u32,
    pub shard: Option<[u16; 2]>,
}

/// Unrecoverable session outcomes that terminate the process.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("reconnect budget exhausted after {0} consecutive failures")]
    RetryBudgetExhausted(u32),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Deadline for one connect attempt, handshake included
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Short delay before the first retry after a plain transport drop
    pub fast_retry: Duration,
    /// Grace period for draining in-flight dispatch
    pub drain_grace: Duration,
    pub shard: Option<[u16; 2]>,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            connect_timeout: config.connect_timeout(),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(config.gateway.reconnect_initial_ms),
                max_delay: Duration::from_millis(config.gateway.reconnect_max_ms),
                multiplier: 2,
                max_retries: config.gateway.reconnect_max_retries,
                jitter: 0.25,
            },
            fast_retry: Duration::from_millis(config.gateway.fast_retry_ms),
            drain_grace: config.drain_grace(),
            shard: config.gateway.shard,
        }
    }
}

enum LoopOutcome {
    /// stop() was invoked; shut down gracefully
    Stopped,
    /// The transport dropped; reconnect
    Dropped(String),
}

/// Owns the gateway session lifecycle and routes inbound events to the
/// extension manager. One bad handler never drops the session; one dropped
/// session always either recovers or terminates with a clear error.
pub struct ConnectionSupervisor {
    transport: Arc<dyn GatewayTransport>,
    manager: Arc<ExtensionManager>,
    sink: SinkHandle,
    config: SupervisorConfig,
    session: Mutex<Session>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        manager: Arc<ExtensionManager>,
        sink: SinkHandle,
        config: SupervisorConfig,
    ) -> Self {
        let shard = config.shard;
        Self {
            transport,
            manager,
            sink,
            config,
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                last_heartbeat_ack: None,
                reconnect_attempts: 0,
                shard,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Request graceful shutdown. Safe to call from any task, repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_session().state
    }

    pub fn session_snapshot(&self) -> Session {
        self.lock_session().clone()
    }

    /// Run the session until stopped or unrecoverably failed.
    ///
    /// Blocks the caller for the lifetime of the bot. Returns Ok on
    /// graceful stop; Err only for the non-retryable cases.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut backoff = BackoffState::new(self.config.backoff.clone());
        let mut fast_retry_pending = false;

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            // A session that was up and then dropped gets one quick retry
            // before the backoff ladder applies.
            if fast_retry_pending {
                fast_retry_pending = false;
                if self.sleep_or_cancelled(self.config.fast_retry).await {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_or_cancelled().await {
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Some(Err(ConnectError::AuthRejected(reason))) => {
                    tracing::error!(reason = %reason, "Gateway rejected credentials");
                    self.sink.enqueue(LogEvent::error(
                        "supervisor",
                        format!("authentication rejected: {}", reason),
                    ));
                    self.set_state(ConnectionState::Failed);
                    return Err(SessionError::AuthRejected(reason));
                }
                Some(Err(ConnectError::Transport(e))) => {
                    tracing::warn!(error = %e, "Gateway connect failed");
                    match backoff.record_failure() {
                        Some(delay) => {
                            tracing::info!(
                                delay_ms = delay.as_millis() as u64,
                                attempt = backoff.consecutive_failures(),
                                "Retrying gateway connect"
                            );
                            if self.sleep_or_cancelled(delay).await {
                                self.set_state(ConnectionState::Disconnected);
                                return Ok(());
                            }
                        }
                        None => {
                            let attempts = backoff.consecutive_failures();
                            self.sink.enqueue(LogEvent::error(
                                "supervisor",
                                format!("reconnect budget exhausted after {} attempts", attempts),
                            ));
                            self.set_state(ConnectionState::Failed);
                            return Err(SessionError::RetryBudgetExhausted(attempts));
                        }
                    }
                }
                Some(Ok(mut conn)) => {
                    backoff.record_success();
                    {
                        let mut session = self.lock_session();
                        session.state = ConnectionState::Connected;
                        session.last_heartbeat_ack = Some(Instant::now());
                    }
                    let loaded = self.manager.loaded_names().await;
                    tracing::info!(
                        shard = ?self.config.shard,
                        extensions = loaded.len(),
                        "Gateway session established"
                    );

                    let outcome = self.connected_loop(conn.as_mut()).await;

                    // Drain or abandon in-flight handler dispatch before any
                    // state transition so handlers never race a torn-down
                    // session.
                    self.manager.quiesce(self.config.drain_grace).await;

                    match outcome {
                        LoopOutcome::Stopped => {
                            let _ = conn.close().await;
                            self.set_state(ConnectionState::Disconnected);
                            tracing::info!("Gateway session closed gracefully");
                            return Ok(());
                        }
                        LoopOutcome::Dropped(reason) => {
                            tracing::warn!(reason = %reason, "Gateway session dropped, reconnecting");
                            metrics::record_reconnect();
                            self.sink.enqueue(LogEvent::warning(
                                "supervisor",
                                format!("session dropped: {}", reason),
                            ));
                            {
                                let mut session = self.lock_session();
                                session.state = ConnectionState::Reconnecting;
                                session.reconnect_attempts += 1;
                            }
                            fast_retry_pending = true;
                        }
                    }
                }
            }
        }
    }

    /// One connect attempt, raced against shutdown and bounded by the
    /// connect deadline. `None` means stop() was requested; a timed-out
    /// attempt becomes a transport error so the backoff ladder applies.
    async fn connect_or_cancelled(
        &self,
    ) -> Option<Result<Box<dyn GatewayConnection>, ConnectError>> {
        tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, self.transport.connect()) => {
                Some(result.unwrap_or_else(|_| {
                    Err(ConnectError::Transport(anyhow::anyhow!(
                        "connect attempt exceeded {}ms deadline",
                        self.config.connect_timeout.as_millis()
                    )))
                }))
            }
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Steady-state loop for one established connection: read events,
    /// pulse heartbeats, watch for staleness and cancellation.
    async fn connected_loop(&self, conn: &mut dyn GatewayConnection) -> LoopOutcome {
        enum Action {
            Transport(anyhow::Result<Option<TransportEvent>>),
            Heartbeat,
            Stop,
        }

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let action = tokio::select! {
                ev = conn.next_event() => Action::Transport(ev),
                _ = ticker.tick() => Action::Heartbeat,
                _ = self.cancel.cancelled() => Action::Stop,
            };

            match action {
                Action::Stop => return LoopOutcome::Stopped,
                Action::Heartbeat => {
                    let stale = self
                        .lock_session()
                        .last_heartbeat_ack
                        .map(|ack| ack.elapsed() > self.config.heartbeat_timeout)
                        .unwrap_or(false);
                    if stale {
                        return LoopOutcome::Dropped("heartbeat deadline missed".to_string());
                    }
                    if let Err(e) = conn.send_heartbeat().await {
                        return LoopOutcome::Dropped(format!("heartbeat send failed: {}", e));
                    }
                    tracing::trace!("Heartbeat sent");
                }
                Action::Transport(Ok(Some(event))) => match event {
                    TransportEvent::Hello { .. } => {}
                    TransportEvent::HeartbeatAck => {
                        self.lock_session().last_heartbeat_ack = Some(Instant::now());
                    }
                    TransportEvent::Event(event) => {
                        // Events are only delivered while Connected; anything
                        // read mid-teardown is discarded.
                        if self.state() == ConnectionState::Connected {
                            self.manager.dispatch(event).await;
                        } else {
                            tracing::debug!(event_id = %event.id, "Discarding event outside Connected state");
                        }
                    }
                    TransportEvent::Closed { reason } => return LoopOutcome::Dropped(reason),
                },
                Action::Transport(Ok(None)) => {
                    return LoopOutcome::Dropped("transport stream ended".to_string());
                }
                Action::Transport(Err(e)) => {
                    return LoopOutcome::Dropped(format!("transport error: {}", e));
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock_session().state = state;
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep unless cancelled first; returns true if cancelled.
    async fn sleep_or_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }
}
