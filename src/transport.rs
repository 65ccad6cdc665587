//! Outbound side of the master connection.

use crate::packet::Packet;
use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

/// Sends packets to the master. Sequence numbers are assigned by the caller;
/// replies come back through [`crate::Viewer::dispatch`].
pub trait Transport {
    fn send(&mut self, packet: Packet) -> Result<()>;
}

/// Hands packets to the session's socket writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| anyhow!("master connection closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_close_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = ChannelTransport::new(tx);
        t.send(Packet::notify("delete", vec![])).unwrap();
        assert_eq!(rx.try_recv().unwrap().command, "delete");
        drop(rx);
        assert!(t.send(Packet::notify("delete", vec![])).is_err());
    }
}
