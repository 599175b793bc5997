use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use localwire_common::{
    codec,
    config::validate_endpoint_name,
    endpoint::EndpointCore,
    error::{HandshakeError, CLIENT_DIAL_TIMEOUT, CLIENT_REDIAL_TIMEOUT},
    handshake::{client_handshake, Negotiated, HANDSHAKE_TIMEOUT},
    transport::{is_retryable_dial_error, Connection, Transport},
    ClientConfig, Event, IpcError, PlatformTransport, Status,
};

/// Client side of a localwire channel
pub struct Client<T: Transport = PlatformTransport> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T: Transport> {
    core:         Arc<EndpointCore<T::Conn>>,
    config:       ClientConfig,
    transport:    T,
    // Advertised by the server on every handshake
    max_msg_size: AtomicUsize,
}

impl Client<PlatformTransport> {
    /// Connects to the server listening on `name`.
    ///
    /// Blocks until the handshake completes, the configured timeout passes
    /// or the handshake fails.
    pub fn connect(name: &str, config: ClientConfig) -> Result<Self, IpcError> {
        Self::connect_with(PlatformTransport, name, config)
    }
}

impl<T: Transport> Client<T> {
    /// Connects over a custom transport
    pub fn connect_with(transport: T, name: &str, config: ClientConfig) -> Result<Self, IpcError> {
        validate_endpoint_name(name)?;
        let config = config.normalized();

        tracing::info!(
            "Connecting to '{}' (encryption required: {}, timeout: {:?})",
            name,
            config.encryption_required,
            config.timeout
        );

        let inner = Arc::new(ClientInner {
            core: EndpointCore::new(name, Status::NotConnected),
            config,
            transport,
            max_msg_size: AtomicUsize::new(0),
        });
        inner
            .core
            .announce(&[Status::NotConnected], Status::Connecting);

        let (conn, negotiated) = match inner.dial(CLIENT_DIAL_TIMEOUT) {
            Ok(dialed) => dialed,
            Err(e) => {
                let status = match e {
                    IpcError::Timeout(_) | IpcError::Closed => Status::Closed,
                    _ => Status::Error,
                };
                inner.core.status_cell().transition(&[Status::Connecting], status);
                inner.core.terminate();
                tracing::error!("[{}] Connect failed: {}", name, e);
                return Err(e);
            }
        };

        if !inner.establish(conn, negotiated, &[Status::Connecting])? {
            return Err(IpcError::Closed);
        }
        Ok(Self { inner })
    }

    /// Blocks for the next message, status change or fatal error.
    ///
    /// After a fatal error has been returned, or after [`Client::close`],
    /// fails with [`IpcError::ReceiveClosed`].
    pub fn receive(&self) -> Result<Event, IpcError> {
        self.inner.core.receive()
    }

    /// Queues a message for the server.
    ///
    /// `data` is checked against the maximum size the server advertised.
    pub fn send(&self, msg_type: u32, data: impl Into<Vec<u8>>) -> Result<(), IpcError> {
        self.inner
            .core
            .send(msg_type, data.into(), self.max_msg_size())
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

    /// Largest payload the server accepts
    pub fn max_msg_size(&self) -> usize {
        self.inner.max_msg_size.load(Ordering::Acquire)
    }

    /// Effective configuration, after normalization
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Disconnects and stops reconnecting. Idempotent.
    pub fn close(&self) {
        if self.inner.core.close() {
            tracing::info!("[{}] Client closed", self.name());
        }
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> ClientInner<T> {
    /// Dials at a fixed interval until a server completes the handshake.
    ///
    /// Fails with [`IpcError::Timeout`] carrying `timeout_message` once the
    /// configured timeout has passed, or with [`IpcError::Closed`] when the
    /// endpoint is closed meanwhile.
    fn dial(&self, timeout_message: &'static str) -> Result<(T::Conn, Negotiated), IpcError> {
        let name = self.core.name();
        let started = Instant::now();

        loop {
            if self.core.queues().is_shut_down() || self.core.status().is_shutting_down() {
                return Err(IpcError::Closed);
            }

            match self.transport.dial(name, &self.config) {
                Ok(mut conn) => match self.handshake(&mut conn) {
                    Ok(negotiated) => return Ok((conn, negotiated)),
                    Err(e) if is_refusal(&e) => {
                        // The server is still busy with its previous client
                        tracing::debug!("[{}] Server hung up during the handshake: {}", name, e);
                        if let Err(e) = conn.shutdown() {
                            tracing::debug!("[{}] Shutdown after refusal: {}", name, e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("[{}] Handshake failed: {}", name, e);
                        if let Err(e) = conn.shutdown() {
                            tracing::debug!("[{}] Shutdown after failed handshake: {}", name, e);
                        }
                        return Err(e.into());
                    }
                },
                Err(e) if is_retryable_dial_error(&e) => {
                    tracing::debug!("[{}] Server not available yet: {}", name, e);
                }
                Err(e) => self.core.notice(format!("dial failed, retrying: {e}")),
            }

            let timeout = self.config.timeout;
            if !timeout.is_zero() && started.elapsed() >= timeout {
                return Err(IpcError::Timeout(timeout_message));
            }
            if !self.core.queues().sleep(self.config.retry_timer) {
                return Err(IpcError::Closed);
            }
        }
    }

    fn handshake(&self, conn: &mut T::Conn) -> Result<Negotiated, HandshakeError> {
        conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let negotiated = client_handshake(conn, self.config.encryption_required)?;
        conn.set_read_timeout(None)?;
        tracing::debug!(
            "[{}] Server accepts messages up to {} bytes",
            self.core.name(),
            negotiated.max_msg_size
        );
        Ok(negotiated)
    }

    fn establish(
        self: &Arc<Self>,
        conn: T::Conn,
        negotiated: Negotiated,
        from: &[Status],
    ) -> Result<bool, IpcError> {
        self.max_msg_size
            .store(negotiated.max_msg_size, Ordering::Release);
        let limit = codec::inbound_limit(negotiated.max_msg_size, negotiated.encryption.is_some());

        let inner = Arc::clone(self);
        self.core
            .attach(conn, negotiated.encryption, limit, from, move |_| inner.reconnect())
    }

    /// Runs on the reader thread of the epoch that just failed
    fn reconnect(self: Arc<Self>) {
        if !self.core.announce(&[Status::Connected], Status::ReConnecting) {
            return;
        }
        tracing::info!("[{}] Reconnecting", self.core.name());

        let failure = match self.dial(CLIENT_REDIAL_TIMEOUT) {
            Ok((conn, negotiated)) => {
                match self.establish(conn, negotiated, &[Status::ReConnecting]) {
                    Ok(_) => return,
                    Err(e) => (Status::Error, e),
                }
            }
            Err(IpcError::Closed) => return,
            Err(e @ IpcError::Timeout(_)) => (Status::Timeout, e),
            Err(e) => (Status::Error, e),
        };

        let (status, err) = failure;
        if self.core.announce(&[Status::ReConnecting], status) {
            self.core.fail(err);
        }
    }
}

/// A server that closes the connection before saying anything is refusing
/// an extra client
fn is_refusal(err: &HandshakeError) -> bool {
    matches!(
        err,
        HandshakeError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
        )
    )
}
