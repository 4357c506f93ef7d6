use std::sync::Arc;

use anyhow::Result;
use sendrecv_lib::signaling::socket::{SignalingSocket, WebSocketSocket};
use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::accept_async;
use tracing::{info, info_span, warn, Instrument};

use crate::{connection::RelayConnection, registry::PeerRegistry};

/// Accepts websocket connections forever, one task per connection.
pub async fn serve(listener: TcpListener, registry: Arc<Mutex<PeerRegistry>>) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = registry.clone();
        spawn(
            async move {
                let socket = match accept_async(stream).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        warn!("websocket handshake failed: {}", err);
                        return;
                    }
                };
                info!("connected");
                handle_socket(WebSocketSocket::new(socket), registry).await;
                info!("disconnected");
            }
            .instrument(info_span!("conn", %addr)),
        );
    }
}

/// Runs the relay protocol on one socket until it closes.
pub async fn handle_socket<S: SignalingSocket>(mut socket: S, registry: Arc<Mutex<PeerRegistry>>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let mut conn = RelayConnection::new(registry, outbound_tx);
    loop {
        let reply = select! {
            msg = socket.recv() => match msg {
                Ok(Some(text)) => conn.handle_text(&text).await,
                Ok(None) => break,
                Err(err) => {
                    warn!("{}", err);
                    break;
                }
            },
            Some(msg) = outbound_rx.recv() => conn.handle_outbound(msg),
        };
        let Some(reply) = reply else {
            continue;
        };
        if let Err(err) = socket.send(reply).await {
            warn!("{}", err);
            break;
        }
    }
    conn.close().await;
}

#[cfg(test)]
mod tests {
    use sendrecv_lib::signaling::socket::ChannelSocket;

    use super::*;

    async fn recv(socket: &mut ChannelSocket) -> String {
        socket.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let registry = Arc::new(Mutex::new(PeerRegistry::new()));
        let (a_relay, mut a) = ChannelSocket::pair();
        let (b_relay, mut b) = ChannelSocket::pair();
        let a_task = spawn(handle_socket(a_relay, registry.clone()));
        spawn(handle_socket(b_relay, registry.clone()));

        b.send("HELLO b".to_owned()).await.unwrap();
        assert_eq!(recv(&mut b).await, "HELLO");
        a.send("HELLO a".to_owned()).await.unwrap();
        assert_eq!(recv(&mut a).await, "HELLO");
        a.send("SESSION b".to_owned()).await.unwrap();
        assert_eq!(recv(&mut a).await, "SESSION_OK");
        assert_eq!(recv(&mut b).await, "SESSION a");

        a.send("{\"ice\":{}}".to_owned()).await.unwrap();
        assert_eq!(recv(&mut b).await, "{\"ice\":{}}");

        drop(a);
        a_task.await.unwrap();
        assert_eq!(recv(&mut b).await, "SESSION_CLOSED");
        assert!(!registry.lock().await.is_registered("a"));
        assert_eq!(registry.lock().await.session_of("b"), None);
    }
}
