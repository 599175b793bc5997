#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use localwire_client::Client;
use localwire_common::{
    transport::{Connection, Listener, Transport},
    ClientConfig, Event, IpcError, Message, PlatformListener, PlatformSocket, PlatformTransport,
    ServerConfig, Status,
};
use localwire_server::Server;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh directory for socket files, removed when dropped
pub fn socket_dir() -> TempDir {
    init_tracing();
    tempfile::tempdir().expect("create socket directory")
}

pub fn server_config(dir: &Path) -> ServerConfig {
    ServerConfig::new().with_socket_base_path(dir)
}

pub fn client_config(dir: &Path) -> ClientConfig {
    ClientConfig::new()
        .with_socket_base_path(dir)
        .with_timeout(Duration::from_secs(5))
        .with_retry_timer(Duration::from_millis(50))
}

/// Anything events can be received from
pub trait Endpoint {
    fn next(&self) -> Result<Event, IpcError>;
}

impl<T: Transport> Endpoint for Server<T> {
    fn next(&self) -> Result<Event, IpcError> {
        self.receive()
    }
}

impl<T: Transport> Endpoint for Client<T> {
    fn next(&self) -> Result<Event, IpcError> {
        self.receive()
    }
}

pub fn expect_status(endpoint: &impl Endpoint, expected: Status) {
    match endpoint.next() {
        Ok(Event::StatusChanged(status)) => assert_eq!(status, expected),
        other => panic!("expected status {expected}, got {other:?}"),
    }
}

pub fn expect_message(endpoint: &impl Endpoint) -> Message {
    match endpoint.next() {
        Ok(Event::Message(message)) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}

/// Starts a server and a client on `name` and waits until both are connected
pub fn connected_pair(
    name: &str,
    server: ServerConfig,
    client: ClientConfig,
) -> (Server, Client) {
    let server = Server::start(name, server).expect("start server");
    expect_status(&server, Status::Listening);

    let client = Client::connect(name, client).expect("connect client");
    expect_status(&client, Status::Connecting);
    expect_status(&client, Status::Connected);
    expect_status(&server, Status::Connected);

    (server, client)
}

#[derive(Default)]
struct HarnessState {
    wire:            Mutex<Vec<u8>>,
    live:            Mutex<Vec<PlatformSocket>>,
    fail_next_write: AtomicBool,
    failing_dials:   AtomicUsize,
    connections:     AtomicUsize,
}

/// Control side of a [`HarnessTransport`]
#[derive(Clone, Default)]
pub struct Harness {
    state: Arc<HarnessState>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> HarnessTransport {
        HarnessTransport {
            state: self.state.clone(),
        }
    }

    /// Every byte read or written through any connection so far
    pub fn wire(&self) -> Vec<u8> {
        self.state.wire.lock().unwrap().clone()
    }

    /// Shuts down every connection opened so far
    pub fn sever(&self) {
        for conn in self.state.live.lock().unwrap().drain(..) {
            let _ = conn.shutdown();
        }
    }

    /// Makes the next write on any connection fail
    pub fn fail_next_write(&self) {
        self.state.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Makes the next `count` dials fail with `PermissionDenied`
    pub fn fail_next_dials(&self, count: usize) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

/// Platform transport with taps and fault injection
pub struct HarnessTransport {
    state: Arc<HarnessState>,
}

pub struct HarnessListener {
    inner: PlatformListener,
    state: Arc<HarnessState>,
}

pub struct HarnessConn {
    inner: PlatformSocket,
    state: Arc<HarnessState>,
}

impl HarnessConn {
    fn track(inner: PlatformSocket, state: &Arc<HarnessState>) -> io::Result<Self> {
        state.live.lock().unwrap().push(inner.try_clone()?);
        state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            inner,
            state: state.clone(),
        })
    }
}

impl Transport for HarnessTransport {
    type Conn = HarnessConn;
    type Listener = HarnessListener;

    fn listen(&self, name: &str, config: &ServerConfig) -> io::Result<HarnessListener> {
        Ok(HarnessListener {
            inner: PlatformTransport.listen(name, config)?,
            state: self.state.clone(),
        })
    }

    fn dial(&self, name: &str, config: &ClientConfig) -> io::Result<HarnessConn> {
        let failing = self
            .state
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected dial failure",
            ));
        }
        HarnessConn::track(PlatformTransport.dial(name, config)?, &self.state)
    }
}

impl Listener for HarnessListener {
    type Conn = HarnessConn;

    fn accept(&self) -> io::Result<HarnessConn> {
        HarnessConn::track(self.inner.accept()?, &self.state)
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
}

impl Connection for HarnessConn {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
            state: self.state.clone(),
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }
}

impl Read for HarnessConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.state.wire.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Write for HarnessConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        let n = self.inner.write(buf)?;
        self.state.wire.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// True if `needle` appears anywhere in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
