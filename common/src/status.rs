use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};

/// Lifecycle status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Created, no transport acquired yet
    NotConnected = 0,
    /// Server is bound and waiting for its client
    Listening    = 1,
    /// Client is dialing for the first time
    Connecting   = 2,
    /// Handshake completed, pipelines running
    Connected    = 3,
    /// Transport failed mid-session, waiting for a new connection
    ReConnecting = 4,
    /// Shut down
    Closed       = 5,
    /// Explicit shutdown in progress
    Closing      = 6,
    /// Unrecoverable handshake or transport failure
    Error        = 7,
    /// Gave up waiting for a connection
    Timeout      = 8,
}

impl Status {
    /// Numeric status code, stable across versions
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Status::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0 => Status::NotConnected,
            1 => Status::Listening,
            2 => Status::Connecting,
            3 => Status::Connected,
            4 => Status::ReConnecting,
            5 => Status::Closed,
            6 => Status::Closing,
            7 => Status::Error,
            8 => Status::Timeout,
            _ => return None,
        };
        Some(status)
    }

    /// True while an explicit close is running or has finished
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Status::Closing | Status::Closed)
    }

    /// True once the endpoint can no longer carry messages
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Closed | Status::Error | Status::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotConnected => "Not Connected",
            Status::Listening => "Listening",
            Status::Connecting => "Connecting",
            Status::Connected => "Connected",
            Status::ReConnecting => "Reconnecting",
            Status::Closed => "Closed",
            Status::Closing => "Closing",
            Status::Error => "Error",
            Status::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomically updated status shared between an endpoint and its threads.
///
/// Phase changes that must not overlap (attach after a handshake, the start
/// of a reconnect, an explicit close) go through [`StatusCell::transition`]
/// or [`StatusCell::begin_close`], so two threads can never both believe they
/// own the same phase.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.code()))
    }

    pub fn get(&self) -> Status {
        // Only codes produced by `Status::code` are ever stored
        Status::from_code(self.0.load(Ordering::Acquire)).unwrap_or(Status::Error)
    }

    pub fn set(&self, status: Status) {
        self.0.store(status.code(), Ordering::Release);
    }

    /// Moves to `to` if the current status is one of `from`.
    ///
    /// Returns false, leaving the status untouched, when another thread got
    /// there first.
    pub fn transition(&self, from: &[Status], to: Status) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                let current = Status::from_code(code)?;
                from.contains(&current).then_some(to.code())
            })
            .is_ok()
    }

    /// Enters `Closing` unless a close is already running or finished
    pub fn begin_close(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                match Status::from_code(code) {
                    Some(status) if status.is_shutting_down() => None,
                    _ => Some(Status::Closing.code()),
                }
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=8 {
            let status = Status::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::from_code(9), None);
    }

    #[test]
    fn display_strings() {
        assert_eq!(Status::NotConnected.to_string(), "Not Connected");
        assert_eq!(Status::ReConnecting.to_string(), "Reconnecting");
        assert_eq!(Status::Timeout.to_string(), "Timeout");
    }

    #[test]
    fn transition_only_from_listed_states() {
        let cell = StatusCell::new(Status::Listening);
        assert!(!cell.transition(&[Status::ReConnecting], Status::Connected));
        assert_eq!(cell.get(), Status::Listening);

        assert!(cell.transition(&[Status::Listening, Status::ReConnecting], Status::Connected));
        assert_eq!(cell.get(), Status::Connected);
    }

    #[test]
    fn begin_close_runs_once() {
        let cell = StatusCell::new(Status::Connected);
        assert!(cell.begin_close());
        assert_eq!(cell.get(), Status::Closing);
        assert!(!cell.begin_close());

        cell.set(Status::Closed);
        assert!(!cell.begin_close());
        assert_eq!(cell.get(), Status::Closed);
    }

    #[test]
    fn close_beats_a_late_attach() {
        let cell = StatusCell::new(Status::ReConnecting);
        assert!(cell.begin_close());
        assert!(!cell.transition(&[Status::ReConnecting], Status::Connected));
        assert_eq!(cell.get(), Status::Closing);
    }
}
