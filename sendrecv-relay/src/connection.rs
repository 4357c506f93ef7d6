use std::{fmt, mem, sync::Arc};

use sendrecv_lib::{
    error::{ProtocolError, RelayError},
    signaling::RelayMessage,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::registry::{Outbound, PeerRegistry};

pub enum ConnectionState {
    Unregistered,
    Registered {
        id: String,
    },
    Paired {
        id: String,
        peer_id: String,
        peer: mpsc::UnboundedSender<Outbound>,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Registered { .. } => write!(f, "registered"),
            Self::Paired { .. } => write!(f, "paired"),
        }
    }
}

fn error_reply(err: impl Into<RelayError>) -> String {
    RelayMessage::Error(err.into().to_string()).to_string()
}

/// Relay protocol state of one websocket connection.
pub struct RelayConnection {
    registry: Arc<Mutex<PeerRegistry>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: ConnectionState,
}

impl RelayConnection {
    pub fn new(registry: Arc<Mutex<PeerRegistry>>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            registry,
            outbound,
            state: ConnectionState::Unregistered,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Unregistered => None,
            ConnectionState::Registered { id } | ConnectionState::Paired { id, .. } => Some(id),
        }
    }

    /// Handles a message from our endpoint. Returns the reply to send back.
    pub async fn handle_text(&mut self, text: &str) -> Option<String> {
        let msg = RelayMessage::parse(text);
        debug!("{} while {}", msg.name(), self.state);
        let state = mem::replace(&mut self.state, ConnectionState::Unregistered);
        let (state, reply) = match (msg, state) {
            (RelayMessage::Hello(Some(id)), ConnectionState::Unregistered) => {
                let result = self
                    .registry
                    .lock()
                    .await
                    .register(&id, self.outbound.clone());
                match result {
                    Ok(()) => (
                        ConnectionState::Registered { id },
                        Some(RelayMessage::Hello(None).to_string()),
                    ),
                    Err(err) => (ConnectionState::Unregistered, Some(error_reply(err))),
                }
            }
            (RelayMessage::Session(peer_id), ConnectionState::Registered { id }) => {
                let result = self.registry.lock().await.pair(&id, &peer_id);
                match result {
                    Ok(peer) => (
                        ConnectionState::Paired { id, peer_id, peer },
                        Some(RelayMessage::SessionOk.to_string()),
                    ),
                    Err(err) => (ConnectionState::Registered { id }, Some(error_reply(err))),
                }
            }
            (RelayMessage::SessionEnd, ConnectionState::Paired { id, .. }) => {
                self.registry.lock().await.end_session(&id);
                (ConnectionState::Registered { id }, None)
            }
            (
                msg @ (RelayMessage::OfferRequest | RelayMessage::Payload(_)),
                ConnectionState::Paired { id, peer_id, peer },
            ) => {
                let relayed = Outbound::Relayed {
                    from: id.clone(),
                    text: msg.to_string(),
                };
                if peer.send(relayed).is_err() {
                    debug!("{} is gone, drop message", peer_id);
                }
                (ConnectionState::Paired { id, peer_id, peer }, None)
            }
            (msg, state) => {
                let err = ProtocolError::out_of_sequence(msg.name(), &state);
                (state, Some(error_reply(err)))
            }
        };
        self.state = state;
        reply
    }

    /// Handles a message queued by another connection. Returns the text to
    /// send to our endpoint.
    pub fn handle_outbound(&mut self, msg: Outbound) -> Option<String> {
        match msg {
            Outbound::Relayed { from, text } => match &self.state {
                ConnectionState::Paired { peer_id, .. } if *peer_id == from => Some(text),
                _ => {
                    debug!("drop message from {} outside its session", from);
                    None
                }
            },
            Outbound::Paired { peer_id, peer } => {
                let ConnectionState::Registered { id } = &self.state else {
                    warn!("paired with {} while {}", peer_id, self.state);
                    return None;
                };
                let id = id.clone();
                let notification = RelayMessage::Session(peer_id.clone()).to_string();
                self.state = ConnectionState::Paired { id, peer_id, peer };
                Some(notification)
            }
            Outbound::SessionClosed { peer_id } => match &self.state {
                ConnectionState::Paired { id, peer_id: current, .. } if *current == peer_id => {
                    self.state = ConnectionState::Registered { id: id.clone() };
                    Some(RelayMessage::SessionClosed.to_string())
                }
                _ => None,
            },
        }
    }

    /// Releases the identity. The peer, if any, gets `SESSION_CLOSED`.
    pub async fn close(&mut self) {
        if let Some(id) = self.id() {
            let id = id.to_owned();
            self.registry.lock().await.unregister(&id);
        }
        self.state = ConnectionState::Unregistered;
    }
}
