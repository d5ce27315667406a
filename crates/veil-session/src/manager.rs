//! Session manager: the connection state machine.
//!
//! All mutable session state lives inside a single worker task. Commands
//! (connect, disconnect, kill-switch changes), network change events,
//! forwarding-loop failures and retry timer expiries are messages into that
//! task, so they are processed strictly one at a time; nothing else ever
//! touches the state, the intent flag or the retry budget. Status reads stay
//! out of the worker entirely: every transition publishes an immutable cell
//! through a watch channel, and readers materialize a snapshot from whatever
//! cell they observe.
//!
//! # Reconnection
//!
//! Losing the network (or the forwarding loop dying) while connected parks
//! the session in `Reconnecting` and schedules a single-shot timer through
//! [`ReconnectPolicy`]. Timers are generation-tagged: cancelling bumps the
//! generation, so a timer that already fired into the queue is ignored when
//! its message is finally processed. A fresh user connect or a disconnect
//! always cancels whatever was pending.
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = SessionManager::builder(provider, backend)
//!     .store(Arc::new(JsonFileStore::new("/var/lib/veil/veil.json")))
//!     .build();
//!
//! session.connect(params).await?;
//! let status = session.status();
//! session.disconnect().await;
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use veil_tun::{
    DEFAULT_MTU, EstablishError, ForwardingLoop, LoopFailure, PipeProvider, TrafficCounters,
    TunnelHandle, TunnelInterface,
};

use crate::backend::TunnelBackend;
use crate::event::{NetworkEvent, NetworkMonitor};
use crate::kill_switch::{KillSwitch, KillSwitchState};
use crate::params::{ConnectionParameters, ParamError};
use crate::policy::{Decision, ReconnectConfig, ReconnectPolicy, RetryState};
use crate::state::{ConnectionState, StatusSnapshot};
use crate::store::{MemoryStore, PreferenceStore, Preferences};

const COMMAND_BUFFER: usize = 32;
const FAILURE_BUFFER: usize = 8;

/// Why a connect request was not honored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// A session with exactly these parameters is already up. Benign:
    /// nothing was changed.
    #[error("already connected")]
    AlreadyConnected,

    #[error("permission to create the tunnel was denied")]
    PermissionDenied,

    #[error("tunnel establishment failed: {0}")]
    EstablishFailed(String),

    #[error("invalid connection parameters: {0}")]
    InvalidParameters(#[from] ParamError),
}

impl From<EstablishError> for ConnectError {
    fn from(error: EstablishError) -> Self {
        match error {
            EstablishError::PermissionDenied => ConnectError::PermissionDenied,
            EstablishError::EstablishFailed(reason) => ConnectError::EstablishFailed(reason),
        }
    }
}

/// Session-wide tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect: ReconnectConfig,
    /// MTU for the tunnel interface.
    pub mtu: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            mtu: DEFAULT_MTU,
        }
    }
}

/// State plus the counters of the tunnel generation that state belongs to,
/// published atomically so readers can never pair them wrongly.
#[derive(Clone)]
struct StatusCell {
    state: ConnectionState,
    counters: Option<Arc<TrafficCounters>>,
}

impl StatusCell {
    fn snapshot(&self) -> StatusSnapshot {
        match &self.counters {
            Some(counters) => StatusSnapshot {
                state: self.state,
                bytes_sent: counters.bytes_sent(),
                bytes_received: counters.bytes_received(),
            },
            None => StatusSnapshot::idle(self.state),
        }
    }
}

/// Push subscription to status changes.
///
/// One snapshot is observable per state transition; counters in the snapshot
/// are read live from the session the state belongs to.
pub struct StatusWatch {
    cell: watch::Receiver<StatusCell>,
}

impl StatusWatch {
    /// Wait for the next state transition and return its snapshot. Fails
    /// once the session manager is gone.
    pub async fn changed(&mut self) -> Result<StatusSnapshot, watch::error::RecvError> {
        self.cell.changed().await?;
        let snapshot = self.cell.borrow_and_update().snapshot();
        Ok(snapshot)
    }

    /// Snapshot of the current status without waiting.
    pub fn current(&self) -> StatusSnapshot {
        self.cell.borrow().snapshot()
    }
}

enum Command {
    Connect {
        params: ConnectionParameters,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetKillSwitch {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Restore {
        reply: oneshot::Sender<Result<bool, ConnectError>>,
    },
    NetworkChanged(NetworkEvent),
    RetryElapsed {
        generation: u64,
    },
}

/// Builder for a [`SessionManager`].
pub struct SessionBuilder {
    provider: Arc<dyn PipeProvider>,
    backend: Arc<dyn TunnelBackend>,
    store: Option<Arc<dyn PreferenceStore>>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Preference store for restart persistence. Defaults to a volatile
    /// in-memory store.
    pub fn store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Platform connectivity monitor. Without one, forwarding-loop failures
    /// are the only loss signal.
    pub fn monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the worker and hand back its handle.
    pub fn build(self) -> SessionManager {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (failure_tx, failure_rx) = mpsc::channel(FAILURE_BUFFER);
        let (status_tx, status_rx) = watch::channel(StatusCell {
            state: ConnectionState::Disconnected,
            counters: None,
        });
        let kill_switch = Arc::new(KillSwitch::new(false));

        let worker = SessionWorker {
            mtu: self.config.mtu,
            policy: ReconnectPolicy::new(self.config.reconnect),
            backend: self.backend,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            monitor: self.monitor,
            kill_switch: kill_switch.clone(),
            interface: TunnelInterface::new(self.provider),
            state: ConnectionState::Disconnected,
            intent: false,
            last_params: None,
            retry: RetryState::new(),
            retry_timer: None,
            pending_retry: None,
            timer_generation: 0,
            session: None,
            event_task: None,
            status_tx,
            commands: command_tx.downgrade(),
            failure_tx,
        };
        tokio::spawn(worker.run(command_rx, failure_rx));

        SessionManager {
            commands: command_tx,
            status: status_rx,
            kill_switch,
        }
    }
}

/// Handle to a running session worker. Cheap to clone; the worker stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusCell>,
    kill_switch: Arc<KillSwitch>,
}

impl SessionManager {
    pub fn builder(
        provider: Arc<dyn PipeProvider>,
        backend: Arc<dyn TunnelBackend>,
    ) -> SessionBuilder {
        SessionBuilder {
            provider,
            backend,
            store: None,
            monitor: None,
            config: SessionConfig::default(),
        }
    }

    /// Establish a session with `params`.
    ///
    /// Validation failures are returned before anything changes. A request
    /// identical to the live session returns [`ConnectError::AlreadyConnected`]
    /// and changes nothing; different parameters replace the live session.
    /// An establishment failure parks the session in the error state and is
    /// not retried on its own.
    pub async fn connect(&self, params: ConnectionParameters) -> Result<(), ConnectError> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Connect { params, reply })
            .await
            .is_err()
        {
            return Err(worker_gone());
        }
        response.await.unwrap_or_else(|_| Err(worker_gone()))
    }

    /// Tear the session down and stay down. Idempotent, never fails.
    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    /// Reapply stored preferences; reconnects if the last run asked to stay
    /// connected. Returns whether a session was brought up.
    pub async fn restore(&self) -> Result<bool, ConnectError> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Restore { reply })
            .await
            .is_err()
        {
            return Err(worker_gone());
        }
        response.await.unwrap_or_else(|_| Err(worker_gone()))
    }

    /// Store and expose the kill-switch preference. Enforcement is the
    /// host's firewall collaborator's job.
    pub async fn set_kill_switch(&self, enabled: bool) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::SetKillSwitch { enabled, reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    /// Current kill-switch condition.
    pub fn kill_switch(&self) -> KillSwitchState {
        self.kill_switch.state()
    }

    /// Non-blocking, consistent status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().snapshot()
    }

    /// Subscribe to state transitions.
    pub fn watch_status(&self) -> StatusWatch {
        StatusWatch {
            cell: self.status.clone(),
        }
    }
}

fn worker_gone() -> ConnectError {
    ConnectError::EstablishFailed("session worker unavailable".to_string())
}

struct ActiveSession {
    handle: TunnelHandle,
    forwarding: ForwardingLoop,
}

struct SessionWorker {
    mtu: u16,
    policy: ReconnectPolicy,
    backend: Arc<dyn TunnelBackend>,
    store: Arc<dyn PreferenceStore>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    kill_switch: Arc<KillSwitch>,
    interface: TunnelInterface,

    state: ConnectionState,
    /// User intent to stay connected. Survives Reconnecting and Error;
    /// cleared only by disconnect, a failed user connect, or (if configured)
    /// retry exhaustion.
    intent: bool,
    last_params: Option<ConnectionParameters>,
    retry: RetryState,

    retry_timer: Option<JoinHandle<()>>,
    /// Generation of the scheduled-but-unprocessed timer, if any.
    pending_retry: Option<u64>,
    timer_generation: u64,

    session: Option<ActiveSession>,
    event_task: Option<JoinHandle<()>>,

    status_tx: watch::Sender<StatusCell>,
    commands: mpsc::WeakSender<Command>,
    failure_tx: mpsc::Sender<LoopFailure>,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut failures: mpsc::Receiver<LoopFailure>,
    ) {
        debug!("session worker started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(failure) = failures.recv() => self.handle_loop_failure(failure),
            }
        }
        // every handle is gone; leave no tasks or tunnels behind
        self.cancel_retry();
        self.unsubscribe_monitor();
        self.teardown_session();
        debug!("session worker stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { params, reply } => {
                let result = self.connect(params).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::SetKillSwitch { enabled, reply } => {
                self.set_kill_switch(enabled);
                let _ = reply.send(());
            }
            Command::Restore { reply } => {
                let result = self.restore().await;
                let _ = reply.send(result);
            }
            Command::NetworkChanged(event) => self.network_changed(event),
            Command::RetryElapsed { generation } => self.retry_elapsed(generation).await,
        }
    }

    async fn connect(&mut self, params: ConnectionParameters) -> Result<(), ConnectError> {
        params.validate()?;
        if self.state.is_connected() && self.last_params.as_ref() == Some(&params) {
            debug!("connect ignored: identical session already up");
            return Err(ConnectError::AlreadyConnected);
        }

        info!("connect requested: {}", params.endpoint);
        self.cancel_retry();
        self.retry.reset();
        self.intent = true;
        self.teardown_session();
        self.set_state(ConnectionState::Connecting);

        match self.establish(&params).await {
            Ok(()) => {
                self.last_params = Some(params);
                self.persist_preferences();
                self.subscribe_monitor();
                Ok(())
            }
            Err(error) => {
                warn!("connect failed: {error}");
                // a rejected user request is not retried behind the user's back
                self.intent = false;
                self.unsubscribe_monitor();
                self.kill_switch.on_tunnel_down();
                self.set_state(ConnectionState::Error);
                Err(error)
            }
        }
    }

    /// Bring up transport, pipe and forwarding loop for `params`.
    /// Transitions to Connected on success; the caller decides what a
    /// failure means.
    async fn establish(&mut self, params: &ConnectionParameters) -> Result<(), ConnectError> {
        self.teardown_session();
        let transport = self.backend.establish(params).await?;
        let config = params.interface_config(self.mtu);
        let handle = self.interface.acquire(&config).await?;
        let forwarding =
            ForwardingLoop::spawn(handle.clone(), transport, self.failure_tx.clone());
        self.session = Some(ActiveSession { handle, forwarding });
        self.kill_switch.on_tunnel_up();
        self.retry.reset();
        self.cancel_retry();
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected && !self.intent && self.session.is_none()
        {
            debug!("disconnect ignored: already disconnected");
            return;
        }
        info!("disconnect requested");
        self.cancel_retry();
        self.intent = false;
        self.teardown_session();
        self.unsubscribe_monitor();
        self.kill_switch.on_tunnel_down();
        self.set_state(ConnectionState::Disconnected);
        self.persist_preferences();
    }

    fn set_kill_switch(&mut self, enabled: bool) {
        self.kill_switch.set_enabled(enabled);
        info!(
            "kill switch {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.persist_preferences();
    }

    async fn restore(&mut self) -> Result<bool, ConnectError> {
        let prefs = match self.store.load() {
            Ok(Some(prefs)) => prefs,
            Ok(None) => {
                debug!("nothing stored to restore");
                return Ok(false);
            }
            Err(error) => {
                warn!("preference load failed: {error}");
                return Ok(false);
            }
        };
        self.kill_switch.set_enabled(prefs.kill_switch);
        if !prefs.should_be_connected {
            debug!("stored session did not ask to stay connected");
            return Ok(false);
        }
        let Some(params) = prefs.params else {
            debug!("stay-connected intent stored without parameters");
            return Ok(false);
        };
        info!("restoring previous session: {}", params.endpoint);
        match self.connect(params).await {
            Ok(()) | Err(ConnectError::AlreadyConnected) => Ok(true),
            Err(error) => Err(error),
        }
    }

    fn network_changed(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Lost if self.state.is_connected() => {
                warn!("network lost; entering recovery");
                self.begin_recovery();
            }
            NetworkEvent::Available | NetworkEvent::CapabilitiesChanged
                if !self.state.is_connected() && self.intent =>
            {
                debug!("network usable again ({event:?}); scheduling reconnect");
                self.schedule_retry();
            }
            _ => trace!("ignoring network event {event:?} in state {}", self.state),
        }
    }

    fn handle_loop_failure(&mut self, failure: LoopFailure) {
        let live = self.session.as_ref().map(|s| s.handle.generation());
        if live != Some(failure.generation) {
            debug!(
                "stale forwarding failure (generation {}); ignoring",
                failure.generation
            );
            return;
        }
        if !self.state.is_connected() {
            return;
        }
        warn!(
            "tunnel i/o failed: {}; treating as network loss",
            failure.error
        );
        self.begin_recovery();
    }

    async fn retry_elapsed(&mut self, generation: u64) {
        if self.pending_retry != Some(generation) {
            debug!("stale retry timer (generation {generation}); ignoring");
            return;
        }
        self.pending_retry = None;
        self.retry_timer = None;

        if !self.intent || self.state != ConnectionState::Reconnecting {
            debug!(
                "retry fired in state {} (intent {}); ignoring",
                self.state, self.intent
            );
            return;
        }
        let Some(params) = self.last_params.clone() else {
            warn!("no parameters to reconnect with");
            self.set_state(ConnectionState::Error);
            return;
        };

        info!(
            "reconnect attempt {}: {}",
            self.retry.attempts(),
            params.endpoint
        );
        match self.establish(&params).await {
            Ok(()) => {
                info!("reconnected: {}", params.endpoint);
                self.subscribe_monitor();
            }
            Err(error) => {
                warn!("reconnect attempt failed: {error}");
                self.schedule_retry();
            }
        }
    }

    /// Tear the session down and start the retry cycle. Used for both a
    /// reported network loss and a dying forwarding loop.
    fn begin_recovery(&mut self) {
        self.teardown_session();
        self.kill_switch.on_tunnel_down();
        self.set_state(ConnectionState::Reconnecting);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.pending_retry.is_some() {
            debug!("retry already scheduled; coalescing");
            return;
        }
        match self.policy.schedule_next(&mut self.retry) {
            Decision::Retry { after } => {
                self.timer_generation += 1;
                let generation = self.timer_generation;
                self.pending_retry = Some(generation);
                info!(
                    "reconnect attempt {} scheduled in {:?}",
                    self.retry.attempts(),
                    after
                );
                let commands = self.commands.clone();
                self.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::RetryElapsed { generation }).await;
                    }
                }));
            }
            Decision::GiveUp => self.give_up(),
        }
    }

    /// Invalidate any scheduled or already-fired-but-unprocessed timer.
    fn cancel_retry(&mut self) {
        self.timer_generation += 1;
        self.pending_retry = None;
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn give_up(&mut self) {
        warn!("reconnect attempts exhausted; waiting for a new connect request");
        self.unsubscribe_monitor();
        self.kill_switch.on_tunnel_down();
        if self.policy.config().clear_intent_on_give_up && self.intent {
            self.intent = false;
            self.persist_preferences();
        }
        self.set_state(ConnectionState::Error);
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            // the release closes the pipe, failing any parked read; the
            // loop swallows errors it sees after this point
            session.handle.release();
            session.forwarding.stop();
        }
        self.interface.release();
    }

    fn subscribe_monitor(&mut self) {
        let Some(monitor) = self.monitor.as_ref() else {
            return;
        };
        if self
            .event_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let mut events = monitor.events();
        let commands = self.commands.clone();
        debug!("subscribed to network change events");
        self.event_task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(commands) = commands.upgrade() else {
                            break;
                        };
                        if commands.send(Command::NetworkChanged(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("network monitor lagged; {missed} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn unsubscribe_monitor(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
            debug!("unsubscribed from network change events");
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!("connection state {} -> {}", self.state, next);
        self.state = next;
        let counters = self.session.as_ref().map(|s| s.handle.counters());
        self.status_tx.send_replace(StatusCell {
            state: next,
            counters,
        });
    }

    fn persist_preferences(&self) {
        let prefs = Preferences {
            params: self.last_params.clone(),
            should_be_connected: self.intent,
            kill_switch: self.kill_switch.is_enabled(),
        };
        if let Err(error) = self.store.save(&prefs) {
            warn!("preference save failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ManualMonitor;
    use crate::params::Credential;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;
    use veil_tun::{
        InterfaceConfig, MemoryPipe, MemoryPipeRemote, MemoryTransport, MemoryTransportRemote,
        PacketPipe, TunnelTransport,
    };

    /// Backend whose outcomes are scripted; unscripted calls succeed.
    struct TestBackend {
        plan: Mutex<VecDeque<Result<(), EstablishError>>>,
        calls: Mutex<Vec<Instant>>,
        remotes: Mutex<Vec<MemoryTransportRemote>>,
    }

    impl TestBackend {
        fn scripted(plan: Vec<Result<(), EstablishError>>) -> Arc<Self> {
            Arc::new(Self {
                plan: Mutex::new(plan.into()),
                calls: Mutex::new(Vec::new()),
                remotes: Mutex::new(Vec::new()),
            })
        }

        fn always_ok() -> Arc<Self> {
            Self::scripted(Vec::new())
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_instants(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelBackend for TestBackend {
        async fn establish(
            &self,
            _params: &ConnectionParameters,
        ) -> Result<Arc<dyn TunnelTransport>, EstablishError> {
            self.calls.lock().unwrap().push(Instant::now());
            let outcome = self.plan.lock().unwrap().pop_front().unwrap_or(Ok(()));
            outcome?;
            let (transport, remote) = MemoryTransport::pair();
            self.remotes.lock().unwrap().push(remote);
            Ok(transport)
        }
    }

    struct TestProvider {
        remotes: Mutex<Vec<MemoryPipeRemote>>,
    }

    impl TestProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                remotes: Mutex::new(Vec::new()),
            })
        }

        fn pop_remote(&self) -> Option<MemoryPipeRemote> {
            self.remotes.lock().unwrap().pop()
        }
    }

    #[async_trait]
    impl PipeProvider for TestProvider {
        async fn open(
            &self,
            _config: &InterfaceConfig,
        ) -> Result<Arc<dyn PacketPipe>, EstablishError> {
            let (pipe, remote) = MemoryPipe::pair();
            self.remotes.lock().unwrap().push(remote);
            Ok(pipe)
        }
    }

    fn params_for_port(port: u16) -> ConnectionParameters {
        ConnectionParameters::new(
            format!("vpn.example.com:{port}").parse().unwrap(),
            "10.66.66.2/32".parse().unwrap(),
            Credential::new("private-credential"),
            Credential::new("public-credential"),
        )
    }

    fn test_params() -> ConnectionParameters {
        params_for_port(51820)
    }

    struct Harness {
        manager: SessionManager,
        backend: Arc<TestBackend>,
        provider: Arc<TestProvider>,
        store: Arc<MemoryStore>,
        monitor: Arc<ManualMonitor>,
    }

    fn harness(backend: Arc<TestBackend>) -> Harness {
        harness_with_config(backend, SessionConfig::default())
    }

    fn harness_with_config(backend: Arc<TestBackend>, config: SessionConfig) -> Harness {
        let provider = TestProvider::new();
        let store = Arc::new(MemoryStore::new());
        let monitor = Arc::new(ManualMonitor::new());
        let manager = SessionManager::builder(provider.clone(), backend.clone())
            .store(store.clone())
            .monitor(monitor.clone())
            .config(config)
            .build();
        Harness {
            manager,
            backend,
            provider,
            store,
            monitor,
        }
    }

    async fn wait_for_state(manager: &SessionManager, state: ConnectionState) {
        let mut watch = manager.watch_status();
        if watch.current().state == state {
            return;
        }
        loop {
            let snapshot = tokio::time::timeout(Duration::from_secs(120), watch.changed())
                .await
                .expect("timed out waiting for state")
                .expect("session worker stopped");
            if snapshot.state == state {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_success_publishes_connected() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();

        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.bytes_sent, 0);
        assert_eq!(status.bytes_received, 0);
        assert_eq!(h.backend.call_count(), 1);

        let saved = h.store.contents().unwrap();
        assert!(saved.should_be_connected);
        assert_eq!(saved.params, Some(test_params()));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_params_without_transition() {
        let h = harness(TestBackend::always_ok());

        let mut params = test_params();
        params.private_credential = Credential::new("");
        let result = h.manager.connect(params).await;

        assert!(matches!(result, Err(ConnectError::InvalidParameters(_))));
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);
        assert_eq!(h.backend.call_count(), 0);
        assert_eq!(h.store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_enters_error_and_never_retries() {
        let h = harness(TestBackend::scripted(vec![Err(
            EstablishError::EstablishFailed("peer unreachable".into()),
        )]));

        let result = h.manager.connect(test_params()).await;
        assert!(matches!(result, Err(ConnectError::EstablishFailed(_))));
        assert_eq!(h.manager.status().state, ConnectionState::Error);

        // no retry happens on its own, and network events don't resurrect a
        // request the user never got
        tokio::time::sleep(Duration::from_secs(120)).await;
        h.monitor.emit(NetworkEvent::Available);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.backend.call_count(), 1);
        assert_eq!(h.manager.status().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_permission_denied_maps_through() {
        let h = harness(TestBackend::scripted(vec![Err(
            EstablishError::PermissionDenied,
        )]));
        let result = h.manager.connect(test_params()).await;
        assert_eq!(result, Err(ConnectError::PermissionDenied));
        assert_eq!(h.manager.status().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_connect_twice_with_same_params_is_a_noop() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        let second = h.manager.connect(test_params()).await;

        assert_eq!(second, Err(ConnectError::AlreadyConnected));
        assert_eq!(h.manager.status().state, ConnectionState::Connected);
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_with_new_params_replaces_session() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(params_for_port(51820)).await.unwrap();
        h.manager.connect(params_for_port(51821)).await.unwrap();

        assert_eq!(h.backend.call_count(), 2);
        assert_eq!(h.manager.status().state, ConnectionState::Connected);

        // the first pipe was released when the second session came up
        let mut first_remote = {
            let mut remotes = h.provider.remotes.lock().unwrap();
            remotes.remove(0)
        };
        assert_eq!(first_remote.next_sent().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        h.manager.disconnect().await;
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);
        let saves_after_first = h.store.save_count();

        h.manager.disconnect().await;
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);
        assert_eq!(h.store.save_count(), saves_after_first);

        let saved = h.store.contents().unwrap();
        assert!(!saved.should_be_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_network_recovers_with_backoff() {
        // connect succeeds, first reconnect attempt fails, second succeeds
        let h = harness(TestBackend::scripted(vec![
            Ok(()),
            Err(EstablishError::EstablishFailed("still down".into())),
            Ok(()),
        ]));

        h.manager.connect(test_params()).await.unwrap();
        let lost_at = Instant::now();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Reconnecting).await;

        // a second event while the retry is pending must not double-schedule
        h.monitor.emit(NetworkEvent::Available);

        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(h.backend.call_count(), 3);

        let calls = h.backend.call_instants();
        assert_eq!(calls[1] - lost_at, Duration::from_secs(2));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(4));

        // recovery reset the budget: the next loss starts at 2s again
        let lost_again_at = Instant::now();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Reconnecting).await;
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        let calls = h.backend.call_instants();
        assert_eq!(calls[3] - lost_again_at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_park_in_error() {
        let failed = || Err(EstablishError::EstablishFailed("still down".into()));
        let h = harness(TestBackend::scripted(vec![
            Ok(()),
            failed(),
            failed(),
            failed(),
            failed(),
            failed(),
        ]));

        h.manager.connect(test_params()).await.unwrap();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Error).await;

        // one connect plus exactly five attempts, spaced 2/4/8/16/30s
        assert_eq!(h.backend.call_count(), 6);
        let calls = h.backend.call_instants();
        let gaps: Vec<Duration> = calls.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(gaps[1], Duration::from_secs(4));
        assert_eq!(gaps[2], Duration::from_secs(8));
        assert_eq!(gaps[3], Duration::from_secs(16));
        assert_eq!(gaps[4], Duration::from_secs(30));

        // and no sixth attempt, ever
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.backend.call_count(), 6);
        assert_eq!(h.manager.status().state, ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Reconnecting).await;

        h.manager.disconnect().await;
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);

        // the scheduled timer must not re-establish a torn-down session
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.backend.call_count(), 1);
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_connect_cancels_pending_retry() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Reconnecting).await;

        h.manager.connect(test_params()).await.unwrap();
        assert_eq!(h.manager.status().state, ConnectionState::Connected);
        assert_eq!(h.backend.call_count(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.backend.call_count(), 2);
        assert_eq!(h.manager.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_failure_triggers_recovery() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        // kill the transport under the loop
        h.backend.remotes.lock().unwrap().clear();

        wait_for_state(&h.manager, ConnectionState::Reconnecting).await;
        wait_for_state(&h.manager, ConnectionState::Connected).await;
        assert_eq!(h.backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_traffic_counts_and_resets_per_session() {
        let h = harness(TestBackend::always_ok());
        h.manager.connect(test_params()).await.unwrap();

        let pipe_remote = h.provider.pop_remote().unwrap();
        assert!(pipe_remote.inject(b"four").await);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.manager.status().bytes_received == 4 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("counters never moved");

        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.bytes_received, 4);

        // a replacement session starts the counters over
        h.manager.connect(params_for_port(51821)).await.unwrap();
        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.bytes_received, 0);
    }

    #[tokio::test]
    async fn test_snapshot_never_mixes_generations() {
        let h = harness(TestBackend::always_ok());
        h.manager.connect(test_params()).await.unwrap();

        let pipe_remote = h.provider.pop_remote().unwrap();
        pipe_remote.inject(b"stale-bytes").await;

        let mut watch = h.manager.watch_status();
        h.monitor.emit(NetworkEvent::Lost);
        loop {
            let snapshot = tokio::time::timeout(Duration::from_secs(30), watch.changed())
                .await
                .unwrap()
                .unwrap();
            // while recovering there is no live session, so no byte count
            // from the dead one may leak into the snapshot
            if snapshot.state == ConnectionState::Reconnecting {
                assert_eq!(snapshot.bytes_sent, 0);
                assert_eq!(snapshot.bytes_received, 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_restore_reconnects_when_intent_stored() {
        let backend = TestBackend::always_ok();
        let provider = TestProvider::new();
        let store = Arc::new(MemoryStore::preloaded(Preferences {
            params: Some(test_params()),
            should_be_connected: true,
            kill_switch: true,
        }));
        let manager = SessionManager::builder(provider, backend.clone())
            .store(store)
            .build();

        let resumed = manager.restore().await.unwrap();
        assert!(resumed);
        assert_eq!(manager.status().state, ConnectionState::Connected);
        assert_eq!(manager.kill_switch(), KillSwitchState::Standby);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_stays_down_without_intent() {
        let backend = TestBackend::always_ok();
        let provider = TestProvider::new();
        let store = Arc::new(MemoryStore::preloaded(Preferences {
            params: Some(test_params()),
            should_be_connected: false,
            kill_switch: true,
        }));
        let manager = SessionManager::builder(provider, backend.clone())
            .store(store)
            .build();

        let resumed = manager.restore().await.unwrap();
        assert!(!resumed);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        // the preference still applies, and with no tunnel up it blocks
        assert_eq!(manager.kill_switch(), KillSwitchState::Blocking);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_can_clear_intent_when_configured() {
        let failed = || Err(EstablishError::EstablishFailed("still down".into()));
        let config = SessionConfig {
            reconnect: ReconnectConfig {
                max_attempts: 2,
                clear_intent_on_give_up: true,
                ..ReconnectConfig::default()
            },
            ..SessionConfig::default()
        };
        let h = harness_with_config(
            TestBackend::scripted(vec![Ok(()), failed(), failed()]),
            config,
        );

        h.manager.connect(test_params()).await.unwrap();
        h.monitor.emit(NetworkEvent::Lost);
        wait_for_state(&h.manager, ConnectionState::Error).await;

        let saved = h.store.contents().unwrap();
        assert!(!saved.should_be_connected);
    }

    #[tokio::test]
    async fn test_set_kill_switch_persists_preference() {
        let h = harness(TestBackend::always_ok());

        h.manager.set_kill_switch(true).await;
        assert_eq!(h.manager.kill_switch(), KillSwitchState::Blocking);
        let saved = h.store.contents().unwrap();
        assert!(saved.kill_switch);
        assert!(!saved.should_be_connected);

        h.manager.connect(test_params()).await.unwrap();
        assert_eq!(h.manager.kill_switch(), KillSwitchState::Standby);
    }

    #[tokio::test]
    async fn test_network_events_ignored_after_disconnect() {
        let h = harness(TestBackend::always_ok());

        h.manager.connect(test_params()).await.unwrap();
        h.manager.disconnect().await;

        h.monitor.emit(NetworkEvent::Available);
        h.monitor.emit(NetworkEvent::Lost);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(h.backend.call_count(), 1);
        assert_eq!(h.manager.status().state, ConnectionState::Disconnected);
    }
}
