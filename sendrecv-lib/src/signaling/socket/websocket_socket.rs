use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{trace, warn};

use crate::error::ConnectionError;

use super::SignalingSocket;

pub struct WebSocketSocket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream: WebSocketStream<T>,
}

impl<T> WebSocketSocket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<T>) -> Self {
        Self { stream }
    }
}

fn transport_error(err: impl ToString) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

#[async_trait]
impl<T> SignalingSocket for WebSocketSocket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: String) -> Result<(), ConnectionError> {
        trace!("send: {}", msg);
        self.stream
            .send(Message::Text(msg))
            .await
            .map_err(transport_error)
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            let Some(msg) = self.stream.next().await else {
                return Ok(None);
            };
            match msg.map_err(transport_error)? {
                Message::Text(text) => {
                    trace!("recv: {}", text);
                    return Ok(Some(text));
                }
                Message::Binary(data) => {
                    warn!("Received unknown binary message ({} bytes), ignoring", data.len());
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
