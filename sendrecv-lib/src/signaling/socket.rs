pub mod channel_socket;
pub mod websocket_socket;

use async_trait::async_trait;

use crate::error::ConnectionError;

pub use channel_socket::ChannelSocket;
pub use websocket_socket::WebSocketSocket;

/// A bidirectional text-message transport between an endpoint and the relay.
#[async_trait]
pub trait SignalingSocket: Send {
    async fn send(&mut self, msg: String) -> Result<(), ConnectionError>;

    /// Returns `None` once the other side closed the transport.
    ///
    /// Must be cancel safe: it is polled inside `select!` loops.
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError>;
}
