use std::sync::Arc;

use tokio::{
    spawn,
    sync::{mpsc, Mutex},
};
use tracing::{debug, error, warn};
use webrtc::data_channel::RTCDataChannel;

use super::{CommandChannel, EngineEvent};

/// Sending half of the incoming queue.
///
/// Closing drops the sender, so the receiving side yields `None`.
#[derive(Clone)]
struct IncomingSender(Arc<Mutex<Option<mpsc::Sender<String>>>>);

impl IncomingSender {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    async fn deliver(&self, text: String) {
        let Some(tx) = self.0.lock().await.clone() else {
            return;
        };
        let _ = tx.send(text).await;
    }

    async fn close(&self) {
        self.0.lock().await.take();
    }
}

/// Hooks a webrtc data channel up to a [`CommandChannel`] which is handed to
/// the endpoint through `EngineEvent::DataChannelOpen` once the channel opens.
pub async fn attach(rtc: Arc<RTCDataChannel>, events: mpsc::Sender<EngineEvent>) {
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(16);
    let (incoming_tx, incoming_rx) = mpsc::channel::<String>(16);
    let user_side = Arc::new(Mutex::new(Some(CommandChannel::new(outgoing_tx, incoming_rx))));
    let incoming_tx = IncomingSender::new(incoming_tx);

    let label = rtc.label().to_owned();
    rtc.on_open(Box::new(move || {
        Box::pin(async move {
            debug!("data channel {} open", label);
            let Some(channel) = user_side.lock().await.take() else {
                return;
            };
            let _ = events.send(EngineEvent::DataChannelOpen(channel)).await;
        })
    }));
    {
        let incoming_tx = incoming_tx.clone();
        rtc.on_message(Box::new(move |msg| {
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move {
                if !msg.is_string {
                    warn!("Received binary data channel message, ignoring");
                    return;
                }
                let text = match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("Received non-utf8 data channel message: {}", err);
                        return;
                    }
                };
                incoming_tx.deliver(text).await;
            })
        }));
    }
    {
        let incoming_tx = incoming_tx.clone();
        rtc.on_error(Box::new(move |err| {
            error!("data channel error: {}", err);
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move { incoming_tx.close().await })
        }));
    }
    rtc.on_close(Box::new(move || {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            debug!("data channel closed");
            incoming_tx.close().await;
        })
    }));

    spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            let result = rtc.send_text(text).await;
            if let Err(webrtc::Error::ErrClosedPipe) = result {
                return;
            } else if let Err(err) = result {
                warn!("Failed to send data channel message: {}", err);
            }
        }
        let _ = rtc.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_incoming() {
        let (tx, mut rx) = mpsc::channel(4);
        let incoming_tx = IncomingSender::new(tx);
        let on_error = incoming_tx.clone();

        incoming_tx.deliver("PING 0".to_owned()).await;
        on_error.close().await;
        incoming_tx.deliver("PING 1".to_owned()).await;

        assert_eq!(rx.recv().await.unwrap(), "PING 0");
        assert_eq!(rx.recv().await, None);
    }
}
