use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

use super::SignalingSocket;

/// In-process socket backed by a pair of channels.
pub struct ChannelSocket {
    sender: mpsc::UnboundedSender<String>,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl ChannelSocket {
    pub fn new(
        sender: mpsc::UnboundedSender<String>,
        receiver: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { sender, receiver }
    }

    /// Two sockets wired to each other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }
}

#[async_trait]
impl SignalingSocket for ChannelSocket {
    async fn send(&mut self, msg: String) -> Result<(), ConnectionError> {
        self.sender.send(msg).map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        Ok(self.receiver.recv().await)
    }
}
