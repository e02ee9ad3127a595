//! Connection manager - owns the published VPN state
//!
//! Turns connect intents into tunnels: picks candidate servers from the
//! directory, prepares them on the selected backend, connects with bounded
//! retries, then watches the backend until the connection is replaced or torn
//! down. Only the newest attempt may publish; a superseded attempt ends
//! silently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionSettings, RetryPolicy};
use crate::error::{ConnectionError, PreparationError, VpnError, VpnResult};
use crate::servers::{SelectionContext, ServerDirectory, ServerId};
use crate::vpn::{ConnectIntent, ConnectionPlan, ErrorKind, ProtocolSelection, VpnBackend, VpnManager, VpnState};

const TRANSITIONS_CAPACITY: usize = 64;

type StartFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Scheduled retry, published alongside a non-final error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryInfo {
    /// Attempt that will run next
    pub next_attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

/// Published connection status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpnStatus {
    pub state: VpnState,
    pub intent: Option<ConnectIntent>,
    pub server_id: Option<ServerId>,
    pub protocol: Option<ProtocolSelection>,
    /// 1-based attempt number, 0 when idle
    pub attempt: u32,
    pub retry: Option<RetryInfo>,
    pub since: DateTime<Utc>,
}

impl Default for VpnStatus {
    fn default() -> Self {
        Self {
            state: VpnState::Disabled,
            intent: None,
            server_id: None,
            protocol: None,
            attempt: 0,
            retry: None,
            since: Utc::now(),
        }
    }
}

/// Why an attempt stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Retry(ErrorKind),
    Fatal(ErrorKind),
    Cancelled,
}

impl From<PreparationError> for Failure {
    fn from(e: PreparationError) -> Self {
        if e.is_retryable() {
            Failure::Retry(e.reason())
        } else {
            Failure::Fatal(e.reason())
        }
    }
}

impl From<ConnectionError> for Failure {
    fn from(e: ConnectionError) -> Self {
        if e.is_cancellation() {
            Failure::Cancelled
        } else if e.is_retryable() {
            Failure::Retry(e.reason())
        } else {
            Failure::Fatal(e.reason())
        }
    }
}

struct Attempt {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ActiveConnection {
    generation: u64,
    backend: Arc<dyn VpnBackend>,
    plan: ConnectionPlan,
    monitor: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    directory: Arc<ServerDirectory>,
    backends: Arc<VpnManager>,
    settings: ConnectionSettings,
    status_tx: watch::Sender<VpnStatus>,
    transitions_tx: broadcast::Sender<VpnStatus>,
    /// Publishing gate; bumped by every connect, disconnect and restart
    generation: StdMutex<u64>,
    /// Serializes connect, disconnect and reconnect
    op_lock: Mutex<()>,
    attempt: StdMutex<Option<Attempt>>,
    active: StdMutex<Option<ActiveConnection>>,
}

impl Inner {
    fn begin_generation(&self) -> u64 {
        let mut generation = lock(&self.generation);
        *generation += 1;
        *generation
    }

    fn is_current(&self, generation: u64) -> bool {
        *lock(&self.generation) == generation
    }

    /// Publish `state` if `generation` is still the newest. The gate is held
    /// while sending so a superseded attempt can never publish afterwards.
    fn publish(&self, generation: u64, state: VpnState, update: impl FnOnce(&mut VpnStatus)) -> bool {
        let current = lock(&self.generation);
        if *current != generation {
            debug!("Dropping stale {} from attempt generation {}", state, generation);
            return false;
        }

        let mut next = self.status_tx.borrow().clone();
        let previous = next.state;
        next.state = state;
        next.since = Utc::now();
        update(&mut next);

        info!("VPN state {} -> {}", previous, next.state);
        self.status_tx.send_replace(next.clone());
        // No subscribers is fine
        let _ = self.transitions_tx.send(next);
        drop(current);
        true
    }

    /// Forward a backend-reported state unless it is already published
    fn forward(&self, generation: u64, state: VpnState) -> bool {
        if self.status_tx.borrow().state == state {
            return false;
        }
        self.publish(generation, state, |status| {
            if state == VpnState::Connected {
                status.retry = None;
            }
        })
    }

    fn take_active(&self) -> Option<ActiveConnection> {
        let mut active = lock(&self.active).take();
        if let Some(connection) = active.as_mut() {
            connection.stop_monitor();
        }
        active
    }

    /// Cancel the running attempt and wait for it to finish
    async fn stop_attempt(&self) {
        let attempt = lock(&self.attempt).take();
        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
            if let Err(e) = attempt.task.await {
                if e.is_panic() {
                    error!("Connection attempt panicked: {}", e);
                }
            }
        }
    }

    /// Supersede whatever is running with a new attempt for `intent`.
    /// Callers hold `op_lock`.
    ///
    /// Boxed: the monitor task restarts attempts through here.
    fn start_attempt(self: &Arc<Self>, intent: ConnectIntent) -> StartFuture<'_> {
        Box::pin(async move {
            let generation = self.begin_generation();
            self.stop_attempt().await;

            info!("Connecting: {}", intent);
            self.publish(generation, VpnState::Connecting, |status| {
                status.intent = Some(intent.clone());
                status.server_id = None;
                status.protocol = None;
                status.attempt = 1;
                status.retry = None;
            });

            let cancel = CancellationToken::new();
            let task = tokio::spawn(Arc::clone(self).run_attempt(generation, intent, cancel.clone()));
            *lock(&self.attempt) = Some(Attempt { cancel, task });
        })
    }

    async fn run_attempt(self: Arc<Self>, generation: u64, intent: ConnectIntent, cancel: CancellationToken) {
        let policy: RetryPolicy = self.settings.retry_policy();
        let selection = intent
            .protocol_override()
            .unwrap_or_else(|| self.settings.protocol_selection());
        let context = self.settings.selection_context();
        let mut attempt = 1;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = self.try_candidates(generation, &intent, selection, &context, attempt) => outcome,
            };

            let kind = match outcome {
                Ok(()) | Err(Failure::Cancelled) => return,
                Err(Failure::Fatal(kind)) => {
                    warn!("Connection to {} failed: {}", intent, kind);
                    self.release_active(generation).await;
                    self.publish(generation, VpnState::Error { kind, is_final: true }, |status| {
                        status.retry = None;
                    });
                    return;
                }
                Err(Failure::Retry(kind)) => kind,
            };

            // A failed attempt never leaves the previous tunnel up behind an error
            self.release_active(generation).await;

            if attempt >= policy.max_attempts {
                warn!("Giving up on {} after {} attempts: {}", intent, attempt, kind);
                self.publish(generation, VpnState::Error { kind, is_final: true }, |status| {
                    status.retry = None;
                });
                return;
            }

            let delay = policy.jittered_delay(attempt);
            info!("Attempt {} failed ({}), retrying in {:?}", attempt, kind, delay);
            let published = self.publish(generation, VpnState::Error { kind, is_final: false }, |status| {
                status.retry = Some(RetryInfo {
                    next_attempt: attempt + 1,
                    max_attempts: policy.max_attempts,
                    delay_ms: delay.as_millis() as u64,
                });
            });
            if !published {
                return;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            self.publish(generation, VpnState::Connecting, |status| {
                status.attempt = attempt;
                status.retry = None;
            });
        }
    }

    /// Walk the candidates for one attempt, best first. Candidates that
    /// cannot be prepared or whose tunnel fails with a retryable error are
    /// skipped; the attempt fails once every candidate has been tried.
    async fn try_candidates(
        self: &Arc<Self>,
        generation: u64,
        intent: &ConnectIntent,
        selection: ProtocolSelection,
        context: &SelectionContext,
        attempt: u32,
    ) -> Result<(), Failure> {
        let candidates = self.directory.select(intent, context)?;

        let mut unreachable = None;
        let mut last_error = None;
        for server in candidates {
            match self.backends.prepare(intent, &server, selection).await {
                Ok((backend, plan)) => {
                    self.publish(generation, VpnState::Connecting, |status| {
                        status.server_id = Some(plan.server.server_id.clone());
                        status.protocol = Some(plan.protocol);
                        status.attempt = attempt;
                    });
                    match self.establish(generation, backend, plan).await {
                        Err(Failure::Retry(kind)) => {
                            debug!("Connection to {} failed ({}), trying next candidate", server.server_id, kind);
                            unreachable = Some(kind);
                        }
                        result => return result,
                    }
                }
                Err(e) if e.try_next_candidate() => {
                    debug!("Skipping {}: {}", server.server_id, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match unreachable {
            Some(kind) => Err(Failure::Retry(kind)),
            None => Err(last_error.unwrap_or(PreparationError::NoServerAvailable).into()),
        }
    }

    /// Tear down the connection an attempt was meant to replace. Skipped once
    /// a newer request owns the manager.
    async fn release_active(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if let Some(previous) = self.take_active() {
            info!("Tearing down connection to {}", previous.plan.server.server_id);
            if let Err(e) = previous.backend.disconnect().await {
                warn!("Failed to disconnect {}: {}", previous.backend.name(), e);
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        backend: Arc<dyn VpnBackend>,
        plan: ConnectionPlan,
    ) -> Result<(), Failure> {
        // The previous connection is replaced, never stacked
        if let Some(previous) = self.take_active() {
            debug!("Replacing connection to {}", previous.plan.server.server_id);
        }
        self.backends.disconnect_others(backend.protocol()).await;

        let mut backend_state = backend.state();
        backend_state.borrow_and_update();
        let result = {
            let connect = backend.connect(&plan);
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => break result,
                    Ok(()) = backend_state.changed() => {
                        let state = *backend_state.borrow_and_update();
                        if matches!(state, VpnState::WaitingForNetwork | VpnState::Connecting) {
                            self.forward(generation, state);
                        }
                    }
                }
            }
        };
        result?;

        let intent = plan.intent.clone();
        let server_id = plan.server.server_id.clone();
        let mut active = lock(&self.active);
        if !self.publish(generation, VpnState::Connected, |status| status.retry = None) {
            return Err(Failure::Cancelled);
        }
        info!("Connected to {} via {}", server_id, backend.name());

        // Hand over the same receiver so nothing reported after connect() is missed
        let monitor = tokio::spawn(Arc::clone(self).monitor(generation, backend_state, Arc::clone(&backend), intent));
        *active = Some(ActiveConnection {
            generation,
            backend,
            plan,
            monitor: Some(monitor),
        });
        Ok(())
    }

    /// Forward backend sub-states while connected; restart on tunnel loss
    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut backend_state: watch::Receiver<VpnState>,
        backend: Arc<dyn VpnBackend>,
        intent: ConnectIntent,
    ) {
        while backend_state.changed().await.is_ok() {
            let state = *backend_state.borrow_and_update();
            match state {
                VpnState::Connecting | VpnState::WaitingForNetwork | VpnState::Connected => {
                    self.forward(generation, state);
                }
                VpnState::Disconnecting => {}
                VpnState::Error { kind: kind @ (ErrorKind::AuthFailed | ErrorKind::PermissionDenied), .. } => {
                    warn!("{} reported {}, giving up", backend.name(), kind);
                    let _op = self.op_lock.lock().await;
                    if self.publish(generation, VpnState::Error { kind, is_final: true }, |_| {}) {
                        lock(&self.active).take();
                    }
                    return;
                }
                VpnState::Error { .. } | VpnState::Disabled => {
                    warn!("{} lost its tunnel ({}), reconnecting", backend.name(), state);
                    let _op = self.op_lock.lock().await;
                    if self.is_current(generation) {
                        self.start_attempt(intent).await;
                    }
                    return;
                }
            }
        }
    }
}

/// Connection manager
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(directory: Arc<ServerDirectory>, backends: Arc<VpnManager>, settings: ConnectionSettings) -> Self {
        let (status_tx, _) = watch::channel(VpnStatus::default());
        let (transitions_tx, _) = broadcast::channel(TRANSITIONS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                directory,
                backends,
                settings,
                status_tx,
                transitions_tx,
                generation: StdMutex::new(0),
                op_lock: Mutex::new(()),
                attempt: StdMutex::new(None),
                active: StdMutex::new(None),
            }),
        }
    }

    /// Latest status; intermediate values may be skipped
    pub fn status(&self) -> watch::Receiver<VpnStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Every transition, in order
    pub fn transitions(&self) -> broadcast::Receiver<VpnStatus> {
        self.inner.transitions_tx.subscribe()
    }

    pub fn current_status(&self) -> VpnStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Server being connected to or in use
    pub fn current_server_id(&self) -> Option<ServerId> {
        let status = self.inner.status_tx.borrow();
        if status.state.is_establishing_or_connected() {
            status.server_id.clone()
        } else {
            None
        }
    }

    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.inner.directory
    }

    /// Start connecting for `intent`, superseding any attempt in flight.
    /// Returns once `Connecting` is published; the outcome arrives through
    /// [`ConnectionManager::status`].
    pub async fn connect(&self, intent: ConnectIntent) {
        let _op = self.inner.op_lock.lock().await;
        self.inner.start_attempt(intent).await;
    }

    /// Cancel any attempt and tear the tunnel down. Runs to completion even
    /// if the caller stops waiting.
    pub async fn disconnect(&self) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _op = inner.op_lock.lock().await;
            let generation = inner.begin_generation();
            inner.stop_attempt().await;
            let active = inner.take_active();

            if active.is_none() && inner.status_tx.borrow().state == VpnState::Disabled {
                debug!("Disconnect while already disabled");
                return;
            }

            inner.publish(generation, VpnState::Disconnecting, |status| status.retry = None);
            inner.backends.disconnect_all().await;
            inner.publish(generation, VpnState::Disabled, |status| {
                status.intent = None;
                status.server_id = None;
                status.protocol = None;
                status.attempt = 0;
            });
        });

        if let Err(e) = task.await {
            error!("Disconnect task failed: {}", e);
        }
    }

    /// Reconnect the active connection with its current plan
    pub async fn reconnect(&self) -> VpnResult<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (generation, backend, intent) = {
            let mut active = lock(&inner.active);
            let connection = active
                .as_mut()
                .ok_or_else(|| VpnError::InvalidState("No active VPN connection".to_string()))?;
            connection.stop_monitor();
            (connection.generation, Arc::clone(&connection.backend), connection.plan.intent.clone())
        };
        if !inner.is_current(generation) {
            return Err(VpnError::InvalidState("Connection is being replaced".to_string()));
        }

        info!("Reconnecting via {}", backend.name());
        inner.publish(generation, VpnState::Connecting, |status| status.retry = None);

        match backend.reconnect().await {
            Ok(()) => {
                let mut backend_state = backend.state();
                backend_state.borrow_and_update();
                inner.publish(generation, VpnState::Connected, |_| {});
                let monitor = tokio::spawn(Arc::clone(inner).monitor(generation, backend_state, Arc::clone(&backend), intent));
                if let Some(connection) = lock(&inner.active).as_mut() {
                    connection.monitor = Some(monitor);
                }
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!("Reconnect failed ({}), starting a new attempt", e);
                inner.take_active();
                inner.start_attempt(intent).await;
                Err(e.into())
            }
            Err(e) => {
                inner.take_active();
                inner.publish(generation, VpnState::Error { kind: e.reason(), is_final: true }, |_| {});
                Err(e.into())
            }
        }
    }
}
