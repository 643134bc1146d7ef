// Client sync agent: keeps one connection to the relay and a local copy of
// the settings.
//
// The agent is split in two halves:
// - `SyncAgent` is the handle the application holds. Local mutations are
//   applied to the snapshot immediately (optimistic, there is no ack) and
//   queued for sending only while the connection is up.
// - The connection task owns the socket and drives `ConnectionMachine`, an
//   explicit Disconnected/Connecting/Connected state machine with exponential
//   reconnect backoff.
//
// Remote `SETTINGS` frames replace the local snapshot wholesale; whatever the
// relay sends on (re)connect therefore wins over local changes made while
// offline.
//
// A relay announcing a different build triggers at most one resync per remote
// build id; after that the agent stays connected and trusts the relay's state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::build::BUILD_ID;
use crate::config::AgentConfig;
use crate::protocol::{parse_envelope, Envelope};
use crate::settings::SettingsState;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to relay at {url}: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Stopped for good: the relay runs another build and the reload handler
    /// asked for a shutdown. The host should restart itself.
    Outdated,
}

/// What the driver should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a new connection.
    Connect,
    /// Connection is up; read frames until it closes.
    AwaitFrames,
    /// Wait this long, then report `reconnect_timer_fired`.
    ScheduleReconnect(Duration),
    Nothing,
}

/// Exponential backoff: `initial`, doubling on each use, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Reconnect state machine, independent of the networking library.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        ConnectionMachine {
            state: ConnectionState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Initial connect on startup.
    pub fn start(&mut self) -> Action {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Action::Connect
            }
            _ => Action::Nothing,
        }
    }

    pub fn on_open(&mut self) -> Action {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Connected;
                self.backoff.reset();
                Action::AwaitFrames
            }
            _ => Action::Nothing,
        }
    }

    /// The connection (or connection attempt) ended; schedule a reconnect.
    pub fn on_close(&mut self) -> Action {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Disconnected;
                Action::ScheduleReconnect(self.backoff.next_delay())
            }
            ConnectionState::Disconnected | ConnectionState::Outdated => Action::Nothing,
        }
    }

    /// Errors are only logged; the close that follows drives reconnection.
    pub fn on_error(&mut self) -> Action {
        Action::Nothing
    }

    pub fn reconnect_timer_fired(&mut self) -> Action {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Action::Connect
            }
            _ => Action::Nothing,
        }
    }
}

// ---------------------------------------------------------------------------
// Version mismatch policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    /// Drop local state and the connection, then resync from the relay.
    /// Asked at most once per remote build id.
    Resync,
    /// Stop the agent so the host process can restart itself.
    Shutdown,
}

/// Decides what happens when the relay announces a different build.
pub trait ReloadHandler: Send + Sync {
    fn on_version_mismatch(&self, local: &str, remote: &str) -> MismatchAction;
}

/// Default policy: resync from scratch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResyncOnMismatch;

impl ReloadHandler for ResyncOnMismatch {
    fn on_version_mismatch(&self, _local: &str, _remote: &str) -> MismatchAction {
        MismatchAction::Resync
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A local state change: either a literal replacement or a function of the
/// previous state.
pub enum StateUpdate {
    Replace(SettingsState),
    With(Box<dyn FnOnce(&SettingsState) -> SettingsState + Send>),
}

impl StateUpdate {
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(&SettingsState) -> SettingsState + Send + 'static,
    {
        StateUpdate::With(Box::new(f))
    }

    fn apply(self, previous: &SettingsState) -> SettingsState {
        match self {
            StateUpdate::Replace(next) => next,
            StateUpdate::With(f) => f(previous),
        }
    }
}

impl From<SettingsState> for StateUpdate {
    fn from(state: SettingsState) -> Self {
        StateUpdate::Replace(state)
    }
}

#[derive(Debug)]
enum Outbound {
    Frame(String),
    Shutdown,
}

/// Application-side handle on a running sync agent.
pub struct SyncAgent {
    snapshot: Arc<watch::Sender<Arc<SettingsState>>>,
    status: watch::Receiver<ConnectionState>,
    outbox: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl SyncAgent {
    /// Start the connection task. The local snapshot starts at the defaults
    /// and is replaced by the relay's catch-up once connected.
    pub fn spawn(config: AgentConfig, reload: Arc<dyn ReloadHandler>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(SettingsState::default()));
        let snapshot = Arc::new(snapshot_tx);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let machine = ConnectionMachine::new(Backoff::new(
            config.reconnect_initial(),
            config.reconnect_max(),
        ));
        let task = ConnectionTask {
            url: config.url,
            machine,
            snapshot: Arc::clone(&snapshot),
            status: status_tx,
            outbox: outbox_rx,
            reload,
            resynced_build: None,
        };

        SyncAgent {
            snapshot,
            status: status_rx,
            outbox: outbox_tx,
            task: tokio::spawn(task.run()),
        }
    }

    /// Current local settings.
    pub fn get(&self) -> Arc<SettingsState> {
        self.snapshot.borrow().clone()
    }

    /// Notified on every local or remote change of the settings.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SettingsState>> {
        self.snapshot.subscribe()
    }

    /// Ends in `Disconnected` after `shutdown`, or in `Outdated` when a build
    /// mismatch stopped the agent.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Apply `update` locally and send the result to the relay. The send is
    /// dropped when the relay is not connected; the local value is kept.
    pub fn set_state(&self, update: impl Into<StateUpdate>) -> Arc<SettingsState> {
        let update = update.into();
        self.apply_local(|previous| update.apply(previous))
    }

    /// Convenience over [`set_state`](Self::set_state) for in-place edits.
    pub fn update_state<F>(&self, edit: F) -> Arc<SettingsState>
    where
        F: FnOnce(&mut SettingsState),
    {
        self.apply_local(|previous| {
            let mut next = previous.clone();
            edit(&mut next);
            next
        })
    }

    fn apply_local<F>(&self, compute: F) -> Arc<SettingsState>
    where
        F: FnOnce(&SettingsState) -> SettingsState,
    {
        // Caller code runs before the watch lock is taken, so it may read this
        // agent's snapshot.
        let next = Arc::new(compute(self.get().as_ref()));
        let connected = *self.status.borrow() == ConnectionState::Connected;

        // Storing and queueing under the watch lock keeps the outbound order
        // identical to the order updates were stored locally.
        self.snapshot.send_modify(|current| {
            *current = Arc::clone(&next);

            if connected {
                match Envelope::settings(next.as_ref().clone()).to_json() {
                    Ok(json) => {
                        let _ = self.outbox.send(Outbound::Frame(json));
                    }
                    Err(e) => warn!("Failed to encode local settings update: {e}"),
                }
            } else {
                debug!("Relay not connected, keeping settings update local");
            }
        });

        next
    }

    /// Stop the connection task and close the connection.
    pub async fn shutdown(self) {
        let _ = self.outbox.send(Outbound::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Sync agent task ended abnormally: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Result of applying one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Applied,
    Ignored,
    Resync,
    Shutdown,
}

/// Validate one frame from the relay and apply it to the local snapshot.
///
/// `resynced` remembers the remote build a resync was already done for; a
/// later `HELLO` from that build is accepted as is.
fn apply_frame(
    text: &str,
    snapshot: &watch::Sender<Arc<SettingsState>>,
    reload: &dyn ReloadHandler,
    local_build: &str,
    resynced: &mut Option<String>,
) -> FrameOutcome {
    let envelope = match parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Ignoring invalid frame from relay: {e}");
            return FrameOutcome::Ignored;
        }
    };

    match envelope {
        Envelope::Settings { state } => {
            snapshot.send_replace(Arc::new(state));
            FrameOutcome::Applied
        }
        Envelope::Hello {
            build_id: Some(remote),
        } if remote != local_build => {
            if resynced.as_deref() == Some(remote.as_str()) {
                debug!("Relay still runs build {remote}, keeping its state");
                return FrameOutcome::Ignored;
            }

            warn!("Version mismatch detected (local {local_build}, relay {remote})");
            match reload.on_version_mismatch(local_build, &remote) {
                MismatchAction::Resync => {
                    *resynced = Some(remote);
                    snapshot.send_replace(Arc::new(SettingsState::default()));
                    FrameOutcome::Resync
                }
                MismatchAction::Shutdown => FrameOutcome::Shutdown,
            }
        }
        Envelope::Hello { .. } => FrameOutcome::Ignored,
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Whether the driver loop keeps going after a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
    /// Stopped by the version mismatch policy.
    Outdated,
}

struct ConnectionTask {
    url: String,
    machine: ConnectionMachine,
    snapshot: Arc<watch::Sender<Arc<SettingsState>>>,
    status: watch::Sender<ConnectionState>,
    outbox: mpsc::UnboundedReceiver<Outbound>,
    reload: Arc<dyn ReloadHandler>,
    resynced_build: Option<String>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut action = self.machine.start();

        let final_state = loop {
            self.status.send_replace(self.machine.state());
            action = match action {
                Action::Connect => match self.connect_and_serve().await {
                    Flow::Continue => {
                        info!("Disconnected from relay at {}", self.url);
                        self.machine.on_close()
                    }
                    Flow::Stop => break ConnectionState::Disconnected,
                    Flow::Outdated => break ConnectionState::Outdated,
                },
                Action::ScheduleReconnect(delay) => match self.wait_for_reconnect(delay).await {
                    Flow::Continue => self.machine.reconnect_timer_fired(),
                    Flow::Stop | Flow::Outdated => break ConnectionState::Disconnected,
                },
                Action::AwaitFrames | Action::Nothing => {
                    warn!("Unexpected {action:?} in sync agent driver, stopping");
                    break ConnectionState::Disconnected;
                }
            };
        };

        self.status.send_replace(final_state);
        info!("Sync agent stopped ({final_state:?})");
    }

    /// Sleep out the backoff delay. Updates issued meanwhile are dropped.
    async fn wait_for_reconnect(&mut self, delay: Duration) -> Flow {
        debug!("Reconnecting to {} in {delay:?}", self.url);
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Flow::Continue,
                outbound = self.outbox.recv() => match outbound {
                    Some(Outbound::Frame(_)) => debug!("Relay not connected, dropping update"),
                    Some(Outbound::Shutdown) | None => return Flow::Stop,
                },
            }
        }
    }

    /// One connection attempt and, if it opens, the connection's lifetime.
    async fn connect_and_serve(&mut self) -> Flow {
        let connecting = tokio_tungstenite::connect_async(self.url.as_str());
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                outbound = self.outbox.recv() => match outbound {
                    Some(Outbound::Frame(_)) => debug!("Relay not connected, dropping update"),
                    Some(Outbound::Shutdown) | None => return Flow::Stop,
                },
            }
        };

        let ws_stream = match result {
            Ok((ws, _response)) => ws,
            Err(source) => {
                let error = AgentError::Connect {
                    url: self.url.clone(),
                    source,
                };
                warn!("{error}");
                self.machine.on_error();
                return Flow::Continue;
            }
        };

        // Drop anything queued before the connection was up.
        while let Ok(outbound) = self.outbox.try_recv() {
            if let Outbound::Shutdown = outbound {
                return Flow::Stop;
            }
        }

        self.machine.on_open();
        self.status.send_replace(self.machine.state());
        info!("Connected to relay at {}", self.url);

        let (mut write, mut read) = ws_stream.split();

        match Envelope::hello(BUILD_ID).to_json() {
            Ok(hello) => {
                if let Err(e) = write.send(Message::text(hello)).await {
                    warn!("Failed to send hello to relay: {e}");
                    self.machine.on_error();
                    return Flow::Continue;
                }
            }
            Err(e) => warn!("Failed to encode hello: {e}"),
        }

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = apply_frame(
                            text.as_str(),
                            &self.snapshot,
                            self.reload.as_ref(),
                            BUILD_ID,
                            &mut self.resynced_build,
                        );
                        match outcome {
                            FrameOutcome::Applied | FrameOutcome::Ignored => {}
                            FrameOutcome::Resync => {
                                info!("Resyncing from relay after version mismatch");
                                let _ = write.send(Message::Close(None)).await;
                                return Flow::Continue;
                            }
                            FrameOutcome::Shutdown => {
                                warn!("Relay runs a different build, stopping sync agent");
                                let _ = write.send(Message::Close(None)).await;
                                return Flow::Outdated;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Relay closed the connection");
                        return Flow::Continue;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay connection error: {e}");
                        self.machine.on_error();
                        return Flow::Continue;
                    }
                    None => return Flow::Continue,
                },

                outbound = self.outbox.recv() => match outbound {
                    Some(Outbound::Frame(json)) => {
                        if let Err(e) = write.send(Message::text(json)).await {
                            warn!("Failed to send settings update: {e}");
                            self.machine.on_error();
                            return Flow::Continue;
                        }
                    }
                    Some(Outbound::Shutdown) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Flow::Stop;
                    }
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
