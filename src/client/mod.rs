//! Command client.
//!
//! One Unix-domain connection carries a strictly ordered stream of
//! request/response command exchanges while the server interleaves
//! unsolicited `subscription` and `log` PDUs on the same wire. The client
//! keeps a FIFO queue with at most one command in flight, demultiplexes
//! unilateral PDUs to a typed callback registry, and on teardown fails every
//! queued and in-flight command exactly once before signalling `end`.
//!
//! Threads: the caller's thread enqueues and writes; a connect thread runs
//! socket discovery; a reader thread owns the decoder. All shared state
//! lives behind one mutex, and completions are always invoked with the lock
//! released so they may safely issue new commands.

pub mod capability;
pub mod discovery;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use thiserror::Error;

use crate::bser::{self, DecodeError, EncodeError, StreamDecoder, Value};
use crate::config::ClientConfig;
use crate::error::{Effect, Transience};

pub use capability::{CapabilityCheckResult, CapabilityQuery};
pub use discovery::DiscoveryError;

/// Inbound object keys that mark a server-initiated message.
const UNILATERAL_TAGS: [&str; 2] = ["subscription", "log"];

// =============================================================================
// ClientError
// =============================================================================

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("unable to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("watchman connection error: {source}")]
    Transport {
        #[source]
        source: io::Error,
    },

    /// The server answered the command with an `error` field. The full
    /// response rides along as diagnostic data.
    #[error("{message}")]
    Watchman { message: String, response: Value },

    #[error("The watchman connection was closed")]
    ConnectionClosed,

    #[error("The client was ended")]
    Ended,

    #[error("connection attempt failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("client required capability `{capability}` is not supported by this server")]
    CapabilityUnsupported { capability: String },

    #[error("malformed version response: {reason}")]
    MalformedVersionResponse { reason: &'static str },
}

impl ClientError {
    /// Whether retrying the operation may succeed.
    pub fn transience(&self) -> Transience {
        match self {
            ClientError::Transport { .. }
            | ClientError::Connect { .. }
            | ClientError::ConnectionClosed
            | ClientError::ConnectFailed { .. }
            | ClientError::Discovery(_) => Transience::Retryable,
            ClientError::Decode(_)
            | ClientError::Encode(_)
            | ClientError::Watchman { .. }
            | ClientError::Ended
            | ClientError::CapabilityUnsupported { .. }
            | ClientError::MalformedVersionResponse { .. } => Transience::Permanent,
        }
    }

    /// What we know about side effects when this error is returned.
    pub fn effect(&self) -> Effect {
        match self {
            // The command may have reached the server before the wire died.
            ClientError::Transport { .. } | ClientError::ConnectionClosed => Effect::Unknown,
            ClientError::Decode(_) => Effect::Unknown,
            ClientError::Encode(_)
            | ClientError::Discovery(_)
            | ClientError::Connect { .. }
            | ClientError::Watchman { .. }
            | ClientError::Ended
            | ClientError::ConnectFailed { .. }
            | ClientError::CapabilityUnsupported { .. }
            | ClientError::MalformedVersionResponse { .. } => Effect::None,
        }
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Connecting,
    ConnectedIdle,
    ConnectedInFlight,
    Closing,
    Closed,
}

type Completion = Box<dyn FnOnce(Result<Value, ClientError>) + Send + 'static>;

struct CommandEntry {
    request: Value,
    complete: Completion,
}

struct ClientInner {
    phase: ClientPhase,
    /// Guards against concurrent connect attempts.
    connecting: bool,
    /// Set when the local side initiated shutdown; read errors that follow
    /// are expected artifacts of closing and stay off the error channel.
    closing: bool,
    queue: VecDeque<CommandEntry>,
    in_flight: Option<CommandEntry>,
    socket: Option<Arc<UnixStream>>,
    /// Bumped on every install and teardown so stale reader and writer
    /// threads from an earlier connection cannot touch current state.
    generation: u64,
}

struct ClientShared {
    inner: Mutex<ClientInner>,
    sinks: EventSinks,
    config: ClientConfig,
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Event sinks
// =============================================================================

type ValueSink = Box<dyn Fn(&Value) + Send + Sync + 'static>;
type ErrorSink = Box<dyn Fn(&ClientError) + Send + Sync + 'static>;
type UnitSink = Box<dyn Fn() + Send + Sync + 'static>;

/// Typed callback registry for server-initiated traffic and lifecycle
/// events. Responses never pass through here; they flow through the FIFO
/// command queue only.
#[derive(Default)]
struct EventSinks {
    connect: Mutex<Vec<UnitSink>>,
    end: Mutex<Vec<UnitSink>>,
    error: Mutex<Vec<ErrorSink>>,
    subscription: Mutex<Vec<ValueSink>>,
    log: Mutex<Vec<ValueSink>>,
}

impl EventSinks {
    fn emit_connect(&self) {
        for sink in locked(&self.connect).iter() {
            sink();
        }
    }

    fn emit_end(&self) {
        for sink in locked(&self.end).iter() {
            sink();
        }
    }

    fn emit_error(&self, err: &ClientError) {
        let sinks = locked(&self.error);
        if sinks.is_empty() {
            tracing::warn!(error = %err, "unhandled watchman client error");
            return;
        }
        for sink in sinks.iter() {
            sink(err);
        }
    }

    fn emit_unilateral(&self, tag: &str, value: &Value) {
        let sinks = match tag {
            "subscription" => locked(&self.subscription),
            _ => locked(&self.log),
        };
        for sink in sinks.iter() {
            sink(value);
        }
    }
}

fn locked<T>(sinks: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    sinks.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Client
// =============================================================================

/// Client for the watchman command protocol.
///
/// Cheap to clone; all clones share one connection. The connection is opened
/// lazily by the first command and re-opened by the next command after a
/// teardown. Dropping the client does not close the connection; call
/// [`end`](Client::end).
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                inner: Mutex::new(ClientInner {
                    phase: ClientPhase::Idle,
                    connecting: false,
                    closing: false,
                    queue: VecDeque::new(),
                    in_flight: None,
                    socket: None,
                    generation: 0,
                }),
                sinks: EventSinks::default(),
                config,
            }),
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.shared.lock().phase
    }

    pub fn on_connect(&self, sink: impl Fn() + Send + Sync + 'static) {
        locked(&self.shared.sinks.connect).push(Box::new(sink));
    }

    pub fn on_end(&self, sink: impl Fn() + Send + Sync + 'static) {
        locked(&self.shared.sinks.end).push(Box::new(sink));
    }

    pub fn on_error(&self, sink: impl Fn(&ClientError) + Send + Sync + 'static) {
        locked(&self.shared.sinks.error).push(Box::new(sink));
    }

    pub fn on_subscription(&self, sink: impl Fn(&Value) + Send + Sync + 'static) {
        locked(&self.shared.sinks.subscription).push(Box::new(sink));
    }

    pub fn on_log(&self, sink: impl Fn(&Value) + Send + Sync + 'static) {
        locked(&self.shared.sinks.log).push(Box::new(sink));
    }

    /// Enqueue a command. The completion is invoked exactly once, with the
    /// response or with the failure that retired the command.
    ///
    /// Commands complete in submission order. A command enqueued while
    /// disconnected is sent once the forthcoming connect finishes.
    pub fn command_with(
        &self,
        request: Value,
        complete: impl FnOnce(Result<Value, ClientError>) + Send + 'static,
    ) {
        let entry = CommandEntry {
            request,
            complete: Box::new(complete),
        };
        let start_connect = {
            let mut inner = self.shared.lock();
            inner.queue.push_back(entry);
            let warn_depth = self.shared.config.queue_warn_depth;
            if warn_depth > 0 && inner.queue.len() >= warn_depth {
                tracing::warn!(depth = inner.queue.len(), "command queue is backing up");
            }
            if inner.socket.is_none() && !inner.connecting {
                inner.connecting = true;
                inner.closing = false;
                inner.phase = ClientPhase::Connecting;
                true
            } else {
                false
            }
        };

        if start_connect {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("watchman-connect".into())
                .spawn(move || run_connect(shared));
            if let Err(source) = spawned {
                self.fail_connect_attempt(ClientError::Transport { source });
            }
        } else {
            pump(&self.shared);
        }
    }

    /// Blocking form of [`command_with`](Client::command_with).
    ///
    /// Must not be called from inside a client callback: the callbacks run
    /// on the reader thread, and blocking it would deadlock the connection.
    pub fn command(&self, request: Value) -> Result<Value, ClientError> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.command_with(request, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Probe server capabilities via the `version` command, synthesizing the
    /// answer from the version string when the server is too old to reply to
    /// a capability query directly.
    pub fn capability_check(
        &self,
        query: &CapabilityQuery,
    ) -> Result<CapabilityCheckResult, ClientError> {
        let response = self.command(capability::version_request(query))?;
        capability::interpret_version_response(&response, query)
    }

    /// Cancel every pending command with "The client was ended" and close
    /// the connection. Idempotent.
    pub fn end(&self) {
        let (stolen, socket) = {
            let mut inner = self.shared.lock();
            inner.closing = true;
            let socket = inner.socket.clone();
            if socket.is_some() {
                inner.phase = ClientPhase::Closing;
            } else if !inner.connecting {
                inner.phase = ClientPhase::Closed;
            }
            (steal_commands(&mut inner), socket)
        };
        for entry in stolen {
            (entry.complete)(Err(ClientError::Ended));
        }
        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn fail_connect_attempt(&self, err: ClientError) {
        let stolen = {
            let mut inner = self.shared.lock();
            inner.connecting = false;
            inner.phase = ClientPhase::Idle;
            steal_commands(&mut inner)
        };
        let reason = err.to_string();
        self.shared.sinks.emit_error(&err);
        for entry in stolen {
            (entry.complete)(Err(ClientError::ConnectFailed {
                reason: reason.clone(),
            }));
        }
    }
}

/// In-flight first, then the queue, leaving both empty. Steals the whole
/// collection so completions that enqueue new commands land in a fresh
/// queue instead of the one being cancelled.
fn steal_commands(inner: &mut ClientInner) -> Vec<CommandEntry> {
    let mut stolen = Vec::with_capacity(inner.queue.len() + 1);
    if let Some(entry) = inner.in_flight.take() {
        stolen.push(entry);
    }
    stolen.extend(inner.queue.drain(..));
    stolen
}

// =============================================================================
// Connection lifecycle
// =============================================================================

fn run_connect(shared: Arc<ClientShared>) {
    let connected = discovery::resolve_socket_path(&shared.config)
        .map_err(ClientError::from)
        .and_then(|path| {
            tracing::debug!(path = %path.display(), "connecting to watchman socket");
            UnixStream::connect(&path)
                .map(Arc::new)
                .map_err(|source| ClientError::Connect { path, source })
        });

    let socket = match connected {
        Ok(socket) => socket,
        Err(err) => {
            let client = Client { shared };
            client.fail_connect_attempt(err);
            return;
        }
    };

    let generation = {
        let mut inner = shared.lock();
        inner.connecting = false;
        if inner.closing {
            // end() raced the connect; do not install the socket.
            inner.phase = ClientPhase::Closed;
            None
        } else {
            inner.generation += 1;
            inner.socket = Some(Arc::clone(&socket));
            inner.phase = ClientPhase::ConnectedIdle;
            Some(inner.generation)
        }
    };
    let Some(generation) = generation else {
        return;
    };

    let reader = {
        let shared = Arc::clone(&shared);
        let socket = Arc::clone(&socket);
        thread::Builder::new()
            .name("watchman-reader".into())
            .spawn(move || run_reader(shared, socket, generation))
    };
    if let Err(source) = reader {
        let _ = socket.shutdown(Shutdown::Both);
        teardown(&shared, generation, Err(ClientError::Transport { source }));
        return;
    }

    shared.sinks.emit_connect();
    pump(&shared);
}

/// Claim and write the next queued command, if the connection is idle.
///
/// The entry is moved into the in-flight slot under the lock, then written
/// with the lock released so the reader can keep dispatching while a large
/// request drains into the socket.
fn pump(shared: &Arc<ClientShared>) {
    enum Claim {
        Write {
            socket: Arc<UnixStream>,
            bytes: bytes::Bytes,
            generation: u64,
        },
        Fail {
            complete: Completion,
            err: ClientError,
        },
        Idle,
    }

    loop {
        let claim = {
            let mut inner = shared.lock();
            match (inner.socket.clone(), inner.in_flight.is_some()) {
                (None, _) | (_, true) => Claim::Idle,
                (Some(socket), false) => match inner.queue.pop_front() {
                    None => {
                        if inner.phase == ClientPhase::ConnectedInFlight {
                            inner.phase = ClientPhase::ConnectedIdle;
                        }
                        Claim::Idle
                    }
                    Some(entry) => match bser::encode(&entry.request) {
                        Ok(bytes) => {
                            let generation = inner.generation;
                            inner.phase = ClientPhase::ConnectedInFlight;
                            inner.in_flight = Some(entry);
                            Claim::Write {
                                socket,
                                bytes,
                                generation,
                            }
                        }
                        Err(err) => Claim::Fail {
                            complete: entry.complete,
                            err: err.into(),
                        },
                    },
                },
            }
        };

        match claim {
            Claim::Idle => return,
            Claim::Fail { complete, err } => {
                complete(Err(err));
                // The queue may hold more commands behind the bad one.
            }
            Claim::Write {
                socket,
                bytes,
                generation,
            } => {
                if let Err(source) = (&*socket).write_all(&bytes) {
                    let current = shared.lock().generation == generation;
                    if current {
                        shared.sinks.emit_error(&ClientError::Transport { source });
                        let _ = socket.shutdown(Shutdown::Both);
                        // The reader observes the dead socket and runs the
                        // teardown, which retires the in-flight entry.
                    }
                }
                return;
            }
        }
    }
}

fn run_reader(shared: Arc<ClientShared>, socket: Arc<UnixStream>, generation: u64) {
    let mut decoder = StreamDecoder::new();
    let mut chunk = vec![0u8; shared.config.read_chunk_bytes.max(1)];
    let outcome = read_loop(&shared, &socket, &mut decoder, &mut chunk);
    teardown(&shared, generation, outcome);
}

fn read_loop(
    shared: &Arc<ClientShared>,
    socket: &Arc<UnixStream>,
    decoder: &mut StreamDecoder,
    chunk: &mut [u8],
) -> Result<(), ClientError> {
    loop {
        let n = match (&**socket).read(chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(source) if source.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(ClientError::Transport { source }),
        };
        decoder.feed(&chunk[..n]);

        // One PDU per poll: dispatch (and its callbacks) runs between
        // polls, so a burst of subscription PDUs in a single read cannot
        // starve command completions or outbound writes.
        loop {
            match decoder.poll() {
                Ok(Some(value)) => dispatch(shared, value),
                Ok(None) => break,
                Err(err) => return Err(ClientError::Decode(err)),
            }
        }
    }
}

fn dispatch(shared: &Arc<ClientShared>, value: Value) {
    // Unilateral tags win over everything else, including an `error` field
    // riding in the same PDU.
    if let Some(obj) = value.as_object() {
        let mut unilateral = false;
        for tag in UNILATERAL_TAGS {
            if obj.contains_key(tag) {
                unilateral = true;
                shared.sinks.emit_unilateral(tag, &value);
            }
        }
        if unilateral {
            return;
        }
    }

    let entry = {
        let mut inner = shared.lock();
        let entry = inner.in_flight.take();
        if entry.is_some() && inner.phase == ClientPhase::ConnectedInFlight {
            inner.phase = ClientPhase::ConnectedIdle;
        }
        entry
    };
    match entry {
        None => {
            // A response for a command that was already cancelled; late
            // responses are dropped, never surfaced as errors.
            tracing::warn!("dropping response with no command in flight");
        }
        Some(entry) => {
            let result = match response_error(&value) {
                Some(message) => Err(ClientError::Watchman {
                    message,
                    response: value,
                }),
                None => Ok(value),
            };
            (entry.complete)(result);
        }
    }

    pump(shared);
}

fn response_error(value: &Value) -> Option<String> {
    let err = value.as_object()?.get("error")?;
    Some(
        err.as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{err:?}")),
    )
}

/// Retire the connection: cancel every queued and in-flight command exactly
/// once with a connection-closed failure, then signal `end`.
fn teardown(shared: &Arc<ClientShared>, generation: u64, outcome: Result<(), ClientError>) {
    let (stolen, locally_closed) = {
        let mut inner = shared.lock();
        if inner.generation != generation {
            return;
        }
        inner.generation += 1;
        inner.socket = None;
        inner.phase = ClientPhase::Closed;
        let locally_closed = inner.closing;
        inner.closing = false;
        (steal_commands(&mut inner), locally_closed)
    };

    if let Err(err) = outcome {
        if locally_closed {
            tracing::debug!(error = %err, "suppressing transport error from local close");
        } else {
            shared.sinks.emit_error(&err);
        }
    }
    for entry in stolen {
        (entry.complete)(Err(ClientError::ConnectionClosed));
    }
    shared.sinks.emit_end();
}
