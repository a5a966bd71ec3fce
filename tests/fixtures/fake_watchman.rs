//! In-process stand-in for the watchman daemon.
//!
//! Binds a Unix socket in a temp dir, runs a caller-supplied handler per
//! accepted connection, and writes a tiny discovery shell script so a client
//! configured with [`FakeWatchman::client_config`] exercises the real
//! `get-sockname` bootstrap path end to end.

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use watchman_ipc::bser::{StreamDecoder, Value, encode};
use watchman_ipc::config::ClientConfig;

/// Serializes tests that read or write process environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// One accepted client connection, speaking BSER PDUs.
pub struct ServerConn {
    stream: UnixStream,
    decoder: StreamDecoder,
}

impl ServerConn {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::new(),
        }
    }

    /// Next request PDU, or None once the client hangs up.
    pub fn recv(&mut self) -> Option<Value> {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(value) = self.decoder.poll().expect("fake server decode") {
                return Some(value);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(_) => return None,
            }
        }
    }

    pub fn send(&mut self, value: &Value) {
        let bytes = encode(value).expect("fake server encode");
        self.stream.write_all(&bytes).expect("fake server write");
    }

    /// Push raw bytes, for exercising decode failures.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("fake server write");
    }
}

pub struct FakeWatchman {
    socket_path: PathBuf,
    cli_path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl FakeWatchman {
    /// Start a server; `handler` runs once per accepted connection with the
    /// zero-based connection index.
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&mut ServerConn, usize) + Send + 'static,
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("fake-watchman.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind fake socket");

        let cli_path = dir.path().join("fake-watchman");
        fs::write(
            &cli_path,
            format!(
                "#!/bin/sh\necho '{{\"sockname\": \"{}\"}}'\n",
                socket_path.display()
            ),
        )
        .expect("write fake cli");
        fs::set_permissions(&cli_path, fs::Permissions::from_mode(0o755))
            .expect("chmod fake cli");

        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut index = 0;
            while let Ok((stream, _)) = listener.accept() {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                handler(&mut ServerConn::new(stream), index);
                index += 1;
            }
        });

        Self {
            socket_path,
            cli_path,
            stop,
            handle: Some(handle),
            _dir: dir,
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Config that discovers this server through the fake CLI script.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            watchman_binary_path: Some(self.cli_path.to_string_lossy().into_owned()),
            ..ClientConfig::default()
        }
    }

    /// Stop accepting and join the server thread, propagating handler panics.
    pub fn join(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the stop flag.
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("fake server thread panicked");
        }
    }
}

/// Poll `cond` until it holds or the timeout lapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Shared, ordered record of observed callbacks.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .expect("event log poisoned")
            .push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().expect("event log poisoned").clone()
    }

    pub fn wait_for_len(&self, len: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.snapshot().len() >= len)
    }
}
