// WebSocket relay: a pub/sub hub for the single "settings" topic.
//
// Architecture: one task per connection plus one broker task.
//
// - **Accept loop** (`Relay::run`): accepts TCP connections and spawns a
//   connection task for each. Returns when the shutdown future resolves.
// - **Connection tasks**: perform the WebSocket handshake (only on the
//   configured path), then forward inbound text frames to the broker in
//   arrival order and drain a per-connection outbox onto the socket.
// - **Broker task**: owns the `SettingsStore` and the subscriber table, and
//   handles `Opened`/`Frame`/`Closed` events one at a time to completion.
//   Since it is the only writer, the store needs no lock.
//
// Outboxes are unbounded so the broker never waits on a slow client.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::build::BUILD_ID;
use crate::config::{ConfigError, RelayConfig};
use crate::protocol::{parse_envelope, Envelope, ProtocolError};
use crate::settings::SettingsState;
use crate::store::{SettingsStore, StoreReader};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub type ConnectionId = u64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid relay configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events sent from connection tasks to the broker.
#[derive(Debug)]
enum RelayEvent {
    Opened {
        id: ConnectionId,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<Message>,
    },
    Frame {
        id: ConnectionId,
        text: String,
    },
    Closed {
        id: ConnectionId,
    },
}

// ---------------------------------------------------------------------------
// Relay (listener + accept loop)
// ---------------------------------------------------------------------------

/// A bound, not yet running relay.
pub struct Relay {
    listener: TcpListener,
    path: Arc<str>,
    idle_timeout: Duration,
    store: SettingsStore,
}

impl Relay {
    /// Bind the relay's single endpoint. The store starts at the compiled-in
    /// defaults; nothing is restored from a previous run.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;

        Ok(Relay {
            listener,
            path: Arc::from(config.path.as_str()),
            idle_timeout: config.idle_timeout(),
            store: SettingsStore::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Read-only handle on the relay's authoritative settings.
    pub fn store_reader(&self) -> StoreReader {
        self.store.reader()
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// connection and stop the broker.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Relay {
            listener,
            path,
            idle_timeout,
            store,
        } = self;

        match listener.local_addr() {
            Ok(addr) => info!("Relay listening on ws://{addr}{path}"),
            Err(e) => warn!("Relay listening on unknown address: {e}"),
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let broker = tokio::spawn(Broker::new(store, BUILD_ID).run(events_rx));

        let mut connections = JoinSet::new();
        let mut next_id: ConnectionId = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Relay shutting down, closing {} connection(s)", connections.len());
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        debug!("Accepted TCP connection {next_id} from {addr}");
                        connections.spawn(serve_connection(
                            stream,
                            addr,
                            next_id,
                            path.clone(),
                            idle_timeout,
                            events_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },

                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        drop(events_tx);
        if let Err(e) = broker.await {
            warn!("Relay broker task ended abnormally: {e}");
        }
        info!("Relay stopped");
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    path: Arc<str>,
    idle_timeout: Duration,
    events: mpsc::Sender<RelayEvent>,
) {
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, endpoint_guard(path)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (write, read) = ws_stream.split();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    if events
        .send(RelayEvent::Opened {
            id,
            addr,
            outbox: outbox_tx.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    // The writer ends once both this task and the broker have dropped their
    // outbox senders.
    let reading = async move {
        process_frames(read, id, idle_timeout, &events, &outbox_tx).await;
        let _ = events.send(RelayEvent::Closed { id }).await;
    };
    tokio::join!(reading, write_frames(write, outbox_rx, id));
}

/// Handshake callback refusing every path except the relay endpoint.
fn endpoint_guard(
    path: Arc<str>,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> {
    move |req: &Request, resp: Response| {
        if req.uri().path() == &*path {
            return Ok(resp);
        }

        warn!("Refusing WebSocket upgrade on {}", req.uri().path());
        let mut rejection = ErrorResponse::new(Some(format!(
            "no WebSocket endpoint at {}",
            req.uri().path()
        )));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}

/// Forward inbound text frames from `read` to the broker until the client
/// closes, errors, or stays silent for `idle_timeout`. Any inbound frame
/// counts as traffic; keepalive pings go out every half timeout. Also stops
/// once the broker is gone.
///
/// Generic over the stream type so it can be tested with in-memory streams.
async fn process_frames<St>(
    mut read: St,
    id: ConnectionId,
    idle_timeout: Duration,
    events: &mpsc::Sender<RelayEvent>,
    outbox: &mpsc::UnboundedSender<Message>,
)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut keepalive = tokio::time::interval(idle_timeout / 2);
    // The first tick completes immediately.
    keepalive.tick().await;

    let idle = tokio::time::sleep_until(idle_deadline(idle_timeout));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = read.next() => {
                idle.as_mut().reset(idle_deadline(idle_timeout));
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let event = RelayEvent::Frame { id, text: text.to_string() };
                        if events.send(event).await.is_err() {
                            debug!("Broker gone, dropping connection {id}");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {id} sent close frame");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame from connection {id}");
                    }
                    Some(Ok(_)) => {
                        // Ping, Pong and raw frames only count as traffic.
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from connection {id}: {e}");
                        break;
                    }
                    None => break,
                }
            }

            _ = &mut idle => {
                info!("Connection {id} idle for {idle_timeout:?}, closing");
                let _ = outbox.send(Message::Close(None));
                break;
            }

            _ = keepalive.tick() => {
                let _ = outbox.send(Message::Ping(Default::default()));
            }
        }
    }
}

/// Deadline `idle_timeout` from now, saturating instead of overflowing.
fn idle_deadline(idle_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(idle_timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

/// Drain the connection's outbox onto the socket.
async fn write_frames<Si>(mut sink: Si, mut outbox: mpsc::UnboundedReceiver<Message>, id: ConnectionId)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = outbox.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("Write to connection {id} failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct Subscriber {
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<Message>,
}

/// Sole owner of the settings store and the subscriber table.
struct Broker {
    store: SettingsStore,
    subscribers: HashMap<ConnectionId, Subscriber>,
    build_id: String,
}

impl Broker {
    fn new(store: SettingsStore, build_id: impl Into<String>) -> Self {
        Broker {
            store,
            subscribers: HashMap::new(),
            build_id: build_id.into(),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>) {
        debug!("Relay broker started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!(
            "Relay broker stopped after {} accepted update(s)",
            self.store.revision()
        );
    }

    /// The single dispatch site for connection events. Per-message failures
    /// are logged here and never reach the connection.
    fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Opened { id, addr, outbox } => self.on_open(id, addr, outbox),
            RelayEvent::Frame { id, text } => {
                if let Err(e) = self.on_frame(id, &text) {
                    warn!("Dropping frame from connection {id}: {e}");
                }
            }
            RelayEvent::Closed { id } => self.on_close(id),
        }
    }

    /// Subscribe the connection and send it the current state (catch-up),
    /// followed by the relay's build identifier.
    fn on_open(&mut self, id: ConnectionId, addr: SocketAddr, outbox: mpsc::UnboundedSender<Message>) {
        match self.catch_up_frames() {
            Ok(frames) => {
                for frame in frames {
                    let _ = outbox.send(Message::text(frame));
                }
            }
            Err(e) => warn!("Failed to encode catch-up for connection {id}: {e}"),
        }

        self.subscribers.insert(id, Subscriber { addr, outbox });
        info!(
            "Client {id} connected from {addr} ({} subscriber(s))",
            self.subscribers.len()
        );
    }

    fn catch_up_frames(&self) -> Result<[String; 2], ProtocolError> {
        let current: &SettingsState = &self.store.get();
        let settings = Envelope::settings(current.clone()).to_json()?;
        let hello = Envelope::hello(self.build_id.as_str()).to_json()?;
        Ok([settings, hello])
    }

    fn on_close(&mut self, id: ConnectionId) {
        if let Some(subscriber) = self.subscribers.remove(&id) {
            info!(
                "Client {id} ({}) disconnected ({} subscriber(s) left)",
                subscriber.addr,
                self.subscribers.len()
            );
        }
    }

    fn on_frame(&mut self, id: ConnectionId, text: &str) -> Result<(), RelayError> {
        match parse_envelope(text)? {
            Envelope::Settings { state } => self.apply_settings(id, state),
            Envelope::Hello { build_id } => {
                self.on_hello(id, build_id.as_deref());
                Ok(())
            }
        }
    }

    /// Replace the stored state and publish it to every subscriber,
    /// the sender included.
    fn apply_settings(&mut self, id: ConnectionId, state: SettingsState) -> Result<(), RelayError> {
        let frame = Envelope::settings(state.clone()).to_json()?;

        info!(
            "Settings update from connection {id}: match {}, screen {:?}",
            state.match_id, state.active_screen
        );
        self.store.set(state);
        self.publish(&frame);
        Ok(())
    }

    fn publish(&self, frame: &str) {
        for (id, subscriber) in &self.subscribers {
            if subscriber.outbox.send(Message::text(frame.to_owned())).is_err() {
                debug!("Connection {id} is closing, skipping publish");
            }
        }
    }

    /// Client handshakes are informational only; the relay's own build is
    /// what clients compare against, so they are never rebroadcast.
    fn on_hello(&self, id: ConnectionId, build_id: Option<&str>) {
        match build_id {
            Some(remote) if remote != self.build_id => warn!(
                "Client {id} runs build {remote}, relay runs {}",
                self.build_id
            ),
            Some(remote) => debug!("Client {id} says hello (build {remote})"),
            None => debug!("Client {id} says hello (no build id)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
