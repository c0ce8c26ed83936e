//! Live plugin connection handle.
//!
//! The hub never touches the socket directly: it pushes frames into an
//! unbounded channel that the socket writer task drains.

use tokio::sync::mpsc;
use uuid::Uuid;

/// A frame queued for a plugin socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct PluginConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PluginConnection {
    /// Create a connection handle and the receiver its writer task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Open until the writer side has gone away.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}
