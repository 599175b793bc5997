//! Queues shared by an endpoint's façade and its background threads, and the
//! read and write loops that move frames between them and the connection.
//!
//! Payloads travel through rendezvous queues in both directions, so a reader
//! only accepts the next frame once the application has taken the previous
//! one and `send` returns once the writer has picked the message up. Status
//! changes, notices and fatal errors use a small buffered queue instead, so
//! establishment never waits on the application.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::{
    codec::{self, Frame},
    crypto::Encryption,
    error::{FrameError, IpcError},
    lock,
    message::{Event, Message},
    transport::Connection,
};

/// Status changes and notices that may wait for the application
pub const EVENT_BACKLOG: usize = 64;

type EventItem = Result<Event, IpcError>;

pub struct Queues {
    events_tx:   Sender<EventItem>,
    events_rx:   Receiver<EventItem>,
    received_tx: Sender<Message>,
    received_rx: Receiver<Message>,
    outbound_tx: Sender<Message>,
    outbound_rx: Receiver<Message>,
    // Dropped to wake every blocked party at once
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed:      AtomicBool,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    pub fn new() -> Self {
        let (events_tx, events_rx) = bounded(EVENT_BACKLOG);
        let (received_tx, received_rx) = bounded(0);
        let (outbound_tx, outbound_rx) = bounded(0);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            events_tx,
            events_rx,
            received_tx,
            received_rx,
            outbound_tx,
            outbound_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queues an event, waiting for room unless the endpoint shuts down
    pub fn publish(&self, event: Event) {
        select! {
            send(self.events_tx, Ok(event)) -> _ => {}
            recv(self.shutdown_rx) -> _ => {}
        }
    }

    /// Queues an event only if there is room right now
    pub fn offer(&self, event: Event) -> bool {
        match self.events_tx.try_send(Ok(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(Ok(event))) => {
                tracing::warn!("Event backlog full, dropping {:?}", event);
                false
            }
            Err(_) => false,
        }
    }

    /// Queues the error `receive()` reports before the endpoint goes quiet
    pub fn fatal(&self, err: IpcError) {
        if let Err(TrySendError::Full(Err(err))) = self.events_tx.try_send(Err(err)) {
            tracing::error!("Event backlog full, fatal error not delivered: {}", err);
        }
    }

    /// Hands a payload to the application. False once the endpoint shuts down.
    pub fn deliver(&self, message: Message) -> bool {
        select! {
            send(self.received_tx, message) -> res => res.is_ok(),
            recv(self.shutdown_rx) -> _ => false,
        }
    }

    /// Hands a payload to the writer. False once the endpoint shuts down.
    pub fn submit(&self, message: Message) -> bool {
        select! {
            send(self.outbound_tx, message) -> res => res.is_ok(),
            recv(self.shutdown_rx) -> _ => false,
        }
    }

    /// Next message for the writer of the epoch tracked by `epoch`
    fn next_outbound(&self, epoch: &Receiver<()>) -> Option<Message> {
        select! {
            recv(self.outbound_rx) -> message => message.ok(),
            recv(epoch) -> _ => None,
            recv(self.shutdown_rx) -> _ => None,
        }
    }

    /// Blocks for the next event.
    ///
    /// Pending status changes and errors are returned before payloads. After
    /// an explicit close, or once the endpoint shut down and every pending
    /// event was taken, fails with [`IpcError::ReceiveClosed`].
    pub fn receive(&self) -> Result<Event, IpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IpcError::ReceiveClosed);
        }
        if let Ok(item) = self.events_rx.try_recv() {
            return item;
        }

        select! {
            recv(self.events_rx) -> item => item.unwrap_or(Err(IpcError::ReceiveClosed)),
            recv(self.received_rx) -> message => {
                message.map(Event::Message).map_err(|_| IpcError::ReceiveClosed)
            }
            recv(self.shutdown_rx) -> _ => {
                self.events_rx.try_recv().unwrap_or(Err(IpcError::ReceiveClosed))
            }
        }
    }

    /// Sleeps for `duration`; false if woken early by shutdown
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.shutdown_rx.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Disconnected once the endpoint shuts down
    pub fn shutdown_signal(&self) -> &Receiver<()> {
        &self.shutdown_rx
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.shutdown_tx).is_none()
    }

    /// Wakes everything blocked on the queues. Idempotent.
    pub fn shut_down(&self) {
        lock(&self.shutdown_tx).take();
    }

    /// Makes `receive` fail immediately from now on
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Reads frames until the connection fails or the endpoint shuts down.
///
/// Returns the failure, or `None` when stopped by shutdown.
pub fn run_reader<C: Connection>(
    name: &str,
    conn: &mut C,
    encryption: Option<Arc<Encryption>>,
    limit: usize,
    queues: &Queues,
) -> Option<FrameError> {
    loop {
        match codec::read_frame(conn, encryption.as_deref(), limit) {
            Ok(Frame::Control(data)) => {
                tracing::trace!("[{}] Ignoring {} byte control frame", name, data.len());
            }
            Ok(Frame::Message(message)) => {
                tracing::trace!(
                    "[{}] Received message type {} ({} bytes)",
                    name,
                    message.msg_type,
                    message.data.len()
                );
                if !queues.deliver(message) {
                    return None;
                }
            }
            Err(e) => return Some(e),
        }
    }
}

/// Writes queued messages in order until the epoch ends or a write fails.
///
/// A failed write shuts the connection down so the reader notices and the
/// endpoint reconnects; the message that failed is lost.
pub fn run_writer<C: Connection>(
    name: &str,
    mut conn: C,
    encryption: Option<Arc<Encryption>>,
    queues: &Queues,
    epoch: Receiver<()>,
) {
    while let Some(message) = queues.next_outbound(&epoch) {
        match codec::write_frame(
            &mut conn,
            message.msg_type,
            &message.data,
            encryption.as_deref(),
        ) {
            Ok(()) => tracing::trace!(
                "[{}] Wrote message type {} ({} bytes)",
                name,
                message.msg_type,
                message.data.len()
            ),
            Err(e) => {
                tracing::warn!(
                    "[{}] Failed to write message type {}: {}",
                    name,
                    message.msg_type,
                    e
                );
                if let Err(e) = conn.shutdown() {
                    tracing::debug!("[{}] Shutdown after failed write: {}", name, e);
                }
                break;
            }
        }
    }
    tracing::trace!("[{}] Writer stopped", name);
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::status::Status;

    #[test]
    fn events_come_before_payloads() {
        let queues = Arc::new(Queues::new());
        queues.publish(Event::StatusChanged(Status::Connected));

        let delivering = {
            let queues = queues.clone();
            thread::spawn(move || queues.deliver(Message::new(1, "after")))
        };
        // Let the payload become ready as well
        thread::sleep(Duration::from_millis(20));

        assert_eq!(
            queues.receive().unwrap(),
            Event::StatusChanged(Status::Connected)
        );
        assert_eq!(
            queues.receive().unwrap(),
            Event::Message(Message::new(1, "after"))
        );
        assert!(delivering.join().unwrap());
    }

    #[test]
    fn shutdown_drains_pending_events_first() {
        let queues = Queues::new();
        queues.publish(Event::StatusChanged(Status::Timeout));
        queues.fatal(IpcError::Timeout("gave up"));
        queues.shut_down();

        assert_eq!(
            queues.receive().unwrap(),
            Event::StatusChanged(Status::Timeout)
        );
        assert!(matches!(queues.receive(), Err(IpcError::Timeout("gave up"))));
        assert!(matches!(queues.receive(), Err(IpcError::ReceiveClosed)));
    }

    #[test]
    fn explicit_close_fails_receive_immediately() {
        let queues = Queues::new();
        queues.publish(Event::Notice("stale".into()));
        queues.mark_closed();
        queues.shut_down();
        assert!(matches!(queues.receive(), Err(IpcError::ReceiveClosed)));
    }

    #[test]
    fn shutdown_unblocks_producers() {
        let queues = Arc::new(Queues::new());
        let blocked = {
            let queues = queues.clone();
            thread::spawn(move || queues.submit(Message::new(1, "never written")))
        };
        thread::sleep(Duration::from_millis(20));
        queues.shut_down();
        assert!(!blocked.join().unwrap());
        assert!(!queues.deliver(Message::new(1, "never read")));
        assert!(!queues.sleep(Duration::from_secs(5)));
    }

    #[test]
    fn offer_drops_when_backlog_is_full() {
        let queues = Queues::new();
        for i in 0..EVENT_BACKLOG {
            assert!(queues.offer(Event::Notice(format!("notice {i}"))));
        }
        assert!(!queues.offer(Event::Notice("one too many".into())));
    }
}
