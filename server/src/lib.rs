//! localwire server endpoint
//!
//! A [`Server`] listens on a named local endpoint and serves exactly one
//! client at a time. [`Server::start`] returns immediately; listening,
//! accepting and the handshake run on background threads and are reported
//! through [`Server::receive`] as status changes. When the client goes away
//! the server returns to accepting and waits for a new one, bounded by the
//! configured timeout.

use std::{
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use localwire_common::{
    codec,
    config::{validate_endpoint_name, DEFAULT_RETRY_TIMER},
    crypto::Encryption,
    endpoint::EndpointCore,
    error::{HandshakeError, SERVER_WAIT_TIMEOUT},
    handshake::{server_handshake, HANDSHAKE_TIMEOUT},
    lock,
    transport::{Connection, Listener, Transport},
    Event, IpcError, PlatformTransport, ServerConfig, Status,
};

/// Statuses in which an incoming connection is accepted
const ACCEPTING: [Status; 2] = [Status::Listening, Status::ReConnecting];

enum Wait {
    Ready,
    TimedOut,
    Abandoned,
}

/// Server side of a localwire channel
pub struct Server<T: Transport = PlatformTransport> {
    inner: Arc<ServerInner<T>>,
}

struct ServerInner<T: Transport> {
    core:      Arc<EndpointCore<T::Conn>>,
    config:    ServerConfig,
    transport: T,
    listener:  Mutex<Option<Arc<T::Listener>>>,
    // Fired by the accept loop once a client completed its handshake
    ready_tx:  Sender<()>,
    ready_rx:  Receiver<()>,
}

impl Server<PlatformTransport> {
    /// Starts a server on the platform's local transport.
    ///
    /// Fails only if `name` is unusable; everything else is reported
    /// through [`Server::receive`].
    pub fn start(name: &str, config: ServerConfig) -> Result<Self, IpcError> {
        Self::start_with(PlatformTransport, name, config)
    }
}

impl<T: Transport> Server<T> {
    /// Starts a server on a custom transport
    pub fn start_with(transport: T, name: &str, config: ServerConfig) -> Result<Self, IpcError> {
        validate_endpoint_name(name)?;
        let config = config.normalized();

        tracing::info!(
            "Starting server '{}' (encryption: {}, max message size: {} bytes, timeout: {:?})",
            name,
            config.encryption,
            config.max_msg_size,
            config.timeout
        );

        let (ready_tx, ready_rx) = bounded(1);
        let inner = Arc::new(ServerInner {
            core: EndpointCore::new(name, Status::NotConnected),
            config,
            transport,
            listener: Mutex::new(None),
            ready_tx,
            ready_rx,
        });

        let establishing = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("{name}-establish"))
            .spawn(move || establishing.establish())?;

        Ok(Self { inner })
    }

    /// Blocks for the next message, status change or fatal error.
    ///
    /// After a fatal error has been returned, or after [`Server::close`],
    /// fails with [`IpcError::ReceiveClosed`].
    pub fn receive(&self) -> Result<Event, IpcError> {
        self.inner.core.receive()
    }

    /// Queues a message for the connected client.
    ///
    /// Returns once the writer has taken the message; a later write failure
    /// surfaces as a reconnection rather than an error here.
    pub fn send(&self, msg_type: u32, data: impl Into<Vec<u8>>) -> Result<(), IpcError> {
        self.inner
            .core
            .send(msg_type, data.into(), self.inner.config.max_msg_size)
    }

    pub fn status(&self) -> Status {
        self.inner.core.status()
    }

    pub fn status_code(&self) -> u8 {
        self.status().code()
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Effective configuration, after normalization
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Stops listening, drops the client and ends every background task.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.core.close() {
            self.inner.close_listener();
            tracing::info!("[{}] Server closed", self.name());
        }
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> ServerInner<T> {
    fn establish(self: Arc<Self>) {
        let name = self.core.name().to_string();

        let listener = match self.transport.listen(&name, &self.config) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                tracing::error!("[{}] Failed to listen: {}", name, e);
                if self.core.announce(&[Status::NotConnected], Status::Error) {
                    self.core.fail(IpcError::Transport(e));
                }
                return;
            }
        };
        *lock(&self.listener) = Some(Arc::clone(&listener));

        if !self.core.announce(&[Status::NotConnected], Status::Listening) {
            // Closed while binding
            self.close_listener();
            return;
        }

        let accepting = Arc::clone(&self);
        if let Err(e) = thread::Builder::new()
            .name(format!("{name}-accept"))
            .spawn(move || accepting.accept_loop(listener))
        {
            self.close_listener();
            if self.core.announce(&ACCEPTING, Status::Error) {
                self.core.fail(IpcError::Transport(e));
            }
            return;
        }

        self.wait_for_client();
    }

    fn accept_loop(self: Arc<Self>, listener: Arc<T::Listener>) {
        let name = self.core.name().to_string();

        loop {
            let mut conn = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if self.listener_closed() || self.core.queues().is_shut_down() {
                        tracing::debug!("[{}] Accept loop stopped: {}", name, e);
                        break;
                    }
                    tracing::warn!("[{}] Accept failed: {}", name, e);
                    if !self.core.queues().sleep(DEFAULT_RETRY_TIMER) {
                        break;
                    }
                    continue;
                }
            };

            let status = self.core.status();
            if !ACCEPTING.contains(&status) {
                tracing::warn!("[{}] Refusing connection while {}", name, status);
                if let Err(e) = conn.shutdown() {
                    tracing::debug!("[{}] Shutdown of refused connection failed: {}", name, e);
                }
                continue;
            }

            tracing::info!("[{}] New connection received", name);
            let encryption = match self.handshake(&mut conn) {
                Ok(encryption) => encryption,
                Err(e) => {
                    tracing::error!("[{}] Handshake failed: {}", name, e);
                    if let Err(e) = conn.shutdown() {
                        tracing::debug!("[{}] Shutdown after failed handshake: {}", name, e);
                    }
                    self.close_listener();
                    if self.core.announce(&ACCEPTING, Status::Error) {
                        self.core.fail(IpcError::Handshake(e));
                    }
                    break;
                }
            };

            let limit = codec::inbound_limit(self.config.max_msg_size, encryption.is_some());

            let inner = Arc::clone(&self);
            match self
                .core
                .attach(conn, encryption, limit, &ACCEPTING, move |_| inner.reconnect())
            {
                // Fired only once Connected
                Ok(true) => {
                    let _ = self.ready_tx.try_send(());
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::error!("[{}] Failed to start pipelines: {}", name, e);
                    if self.core.announce(&ACCEPTING, Status::Error) {
                        self.core.fail(e);
                    }
                    break;
                }
            }
        }

        tracing::debug!("[{}] Accept loop exited", name);
    }

    fn handshake(&self, conn: &mut T::Conn) -> Result<Option<Encryption>, HandshakeError> {
        conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let encryption = server_handshake(conn, self.config.encryption, self.config.max_msg_size)?;
        conn.set_read_timeout(None)?;
        Ok(encryption)
    }

    /// Runs on the reader thread of the epoch that just failed
    fn reconnect(self: Arc<Self>) {
        // A token left over from the previous wait must not end this one
        while self.ready_rx.try_recv().is_ok() {}
        if !self.core.announce(&[Status::Connected], Status::ReConnecting) {
            return;
        }
        tracing::info!("[{}] Waiting for the client to reconnect", self.core.name());
        self.wait_for_client();
    }

    /// Waits for the accept loop to hand over a client, bounded by the
    /// configured timeout
    fn wait_for_client(&self) {
        match self.await_ready() {
            Wait::Ready => {}
            Wait::Abandoned => {}
            Wait::TimedOut => self.time_out(),
        }
    }

    fn await_ready(&self) -> Wait {
        let shutdown = self.core.queues().shutdown_signal();

        if self.config.timeout.is_zero() {
            select! {
                recv(self.ready_rx) -> _ => Wait::Ready,
                recv(shutdown) -> _ => Wait::Abandoned,
            }
        } else {
            select! {
                recv(self.ready_rx) -> _ => Wait::Ready,
                recv(shutdown) -> _ => Wait::Abandoned,
                default(self.config.timeout) => Wait::TimedOut,
            }
        }
    }

    fn time_out(&self) {
        // A client that attached in the meantime wins
        if !self.core.announce(&ACCEPTING, Status::Timeout) {
            return;
        }
        self.close_listener();
        self.core.fail(IpcError::Timeout(SERVER_WAIT_TIMEOUT));
    }

    fn listener_closed(&self) -> bool {
        lock(&self.listener).is_none()
    }

    fn close_listener(&self) {
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.close() {
                tracing::warn!("[{}] Failed to close listener: {}", self.core.name(), e);
            }
        }
    }
}
