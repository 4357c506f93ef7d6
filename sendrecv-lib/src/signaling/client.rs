use std::time::Duration;

use tokio::{net::TcpStream, time::sleep};
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::{info, warn};

use crate::error::ConnectionError;

use super::socket::WebSocketSocket;

pub type RelaySocket = WebSocketSocket<MaybeTlsStream<TcpStream>>;

/// Opens a websocket to the relay, retrying on failure.
///
/// Gives up with [`ConnectionError::RetriesExhausted`] after `max_attempts`
/// failed attempts spaced `interval` apart.
pub async fn connect_with_retries(
    url: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<RelaySocket, ConnectionError> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match connect_async(url).await {
            Ok((stream, _response)) => {
                info!("Connected to {}", url);
                return Ok(WebSocketSocket::new(stream));
            }
            Err(err) => {
                warn!(
                    "Failed to connect to {} ({}/{}): {}",
                    url, attempt, max_attempts, err
                );
                if attempt < max_attempts {
                    sleep(interval).await;
                }
            }
        }
    }
    Err(ConnectionError::RetriesExhausted {
        url: url.to_owned(),
        attempts: max_attempts,
    })
}
