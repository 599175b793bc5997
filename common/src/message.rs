use crate::status::Status;

/// Message type reserved for protocol control frames. Never delivered to
/// applications and never accepted by `send`.
pub const CONTROL_MSG_TYPE: u32 = 0;

/// Application payload carried by one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Application-defined type tag, always non-zero
    pub msg_type: u32,
    /// Payload bytes
    pub data:     Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            data: data.into(),
        }
    }

    /// Payload interpreted as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Something observed by `receive()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A payload sent by the peer
    Message(Message),
    /// The endpoint moved to a new lifecycle status
    StatusChanged(Status),
    /// Non-fatal condition worth reporting, such as an unexpected dial error
    /// that is being retried
    Notice(String),
}

impl Event {
    /// The payload, if this event carries one
    pub fn into_message(self) -> Option<Message> {
        match self {
            Event::Message(message) => Some(message),
            _ => None,
        }
    }
}
