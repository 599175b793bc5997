//! State shared by both endpoint roles: lifecycle status, queues and the
//! single live connection.

use std::{
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_channel::bounded;

use crate::{
    crypto::Encryption,
    error::{FrameError, IpcError},
    lock,
    message::{Event, Message, CONTROL_MSG_TYPE},
    pipeline::{self, Queues},
    status::{Status, StatusCell},
    transport::Connection,
};

pub struct EndpointCore<C: Connection> {
    name:   String,
    status: StatusCell,
    queues: Queues,
    // Control handle of the current epoch, used to tear it down
    conn:   Mutex<Option<C>>,
}

impl<C: Connection> EndpointCore<C> {
    pub fn new(name: impl Into<String>, initial: Status) -> Arc<Self> {
        Arc::new(Self {
            name:   name.into(),
            status: StatusCell::new(initial),
            queues: Queues::new(),
            conn:   Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Moves `from → to` and tells the application. False if the status was
    /// not one of `from`.
    pub fn announce(&self, from: &[Status], to: Status) -> bool {
        if !self.status.transition(from, to) {
            return false;
        }
        tracing::info!("[{}] Status: {}", self.name, to);
        self.queues.publish(Event::StatusChanged(to));
        true
    }

    /// Starts the pipelines for a connection that passed its handshake.
    ///
    /// Returns `Ok(false)`, with the connection dropped, when the status was
    /// no longer one of `from` (an explicit close won the race).
    pub fn attach<F>(
        self: &Arc<Self>,
        conn: C,
        encryption: Option<Encryption>,
        inbound_limit: usize,
        from: &[Status],
        on_failure: F,
    ) -> Result<bool, IpcError>
    where
        F: FnOnce(FrameError) + Send + 'static,
    {
        let mut reader_conn = conn.try_clone()?;
        let writer_conn = conn.try_clone()?;
        if let Some(previous) = lock(&self.conn).replace(conn) {
            if let Err(e) = previous.shutdown() {
                tracing::debug!("[{}] Shutdown of previous connection failed: {}", self.name, e);
            }
        }

        let encryption = encryption.map(Arc::new);
        // Never carries a value; the reader dropping its end stops the writer
        let (epoch_tx, epoch_rx) = bounded::<()>(0);

        let core = Arc::clone(self);
        let writer_encryption = encryption.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("{}-writer", self.name))
            .spawn(move || {
                pipeline::run_writer(
                    &core.name,
                    writer_conn,
                    writer_encryption,
                    &core.queues,
                    epoch_rx,
                )
            })
        {
            self.detach();
            return Err(e.into());
        }

        if !self.status.transition(from, Status::Connected) {
            tracing::debug!(
                "[{}] Dropping new connection, status is {}",
                self.name,
                self.status()
            );
            drop(epoch_tx);
            self.detach();
            return Ok(false);
        }
        tracing::info!("[{}] ✓ Connected", self.name);
        self.queues.publish(Event::StatusChanged(Status::Connected));

        let core = Arc::clone(self);
        if let Err(e) = thread::Builder::new()
            .name(format!("{}-reader", self.name))
            .spawn(move || {
                let failure = pipeline::run_reader(
                    &core.name,
                    &mut reader_conn,
                    encryption,
                    inbound_limit,
                    &core.queues,
                );
                drop(epoch_tx);

                let Some(err) = failure else {
                    return;
                };
                // Only this epoch's stream; a newer one may already be attached
                if let Err(e) = reader_conn.shutdown() {
                    tracing::debug!("[{}] Shutdown after read failure: {}", core.name, e);
                }
                if core.status().is_shutting_down() || core.queues.is_shut_down() {
                    tracing::debug!("[{}] Reader stopped during shutdown: {}", core.name, err);
                    return;
                }
                if err.is_eof() {
                    tracing::info!("[{}] Peer disconnected", core.name);
                } else {
                    tracing::warn!("[{}] Connection failed: {}", core.name, err);
                }
                on_failure(err);
            })
        {
            self.detach();
            return Err(e.into());
        }

        Ok(true)
    }

    /// Shuts the current connection down, ending its pipelines
    pub fn detach(&self) {
        if let Some(conn) = lock(&self.conn).take() {
            if let Err(e) = conn.shutdown() {
                tracing::debug!("[{}] Shutdown failed: {}", self.name, e);
            }
        }
    }

    /// Announces a non-fatal condition
    pub fn notice(&self, message: String) {
        tracing::warn!("[{}] {}", self.name, message);
        self.queues.offer(Event::Notice(message));
    }

    /// Delivers `err` through `receive` and shuts the endpoint down, keeping
    /// the current status
    pub fn fail(&self, err: IpcError) {
        tracing::error!("[{}] {}", self.name, err);
        self.queues.fatal(err);
        self.terminate();
    }

    /// Stops every background task. Pending events stay readable.
    pub fn terminate(&self) {
        self.queues.shut_down();
        self.detach();
    }

    /// Explicit close. Returns false if a close already ran.
    pub fn close(&self) -> bool {
        if !self.status.begin_close() {
            return false;
        }
        tracing::info!("[{}] Closing", self.name);
        self.queues.mark_closed();
        self.terminate();
        self.status.set(Status::Closed);
        true
    }

    /// Validates and queues one message for the writer
    pub fn send(&self, msg_type: u32, data: Vec<u8>, max_msg_size: usize) -> Result<(), IpcError> {
        if msg_type == CONTROL_MSG_TYPE {
            return Err(IpcError::ReservedType);
        }
        if data.len() > max_msg_size {
            return Err(IpcError::MessageTooLarge {
                len: data.len(),
                max: max_msg_size,
            });
        }
        match self.status() {
            Status::Connected => {}
            other => return Err(IpcError::NotConnected(other)),
        }

        if self.queues.submit(Message { msg_type, data }) {
            Ok(())
        } else {
            Err(IpcError::NotConnected(self.status()))
        }
    }

    pub fn receive(&self) -> Result<Event, IpcError> {
        self.queues.receive()
    }
}
