mod data_channel;
pub mod peer_connection;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use derive_new::new;
use tokio::sync::mpsc;

use crate::{
    negotiation::NegotiationRole,
    signaling::{IceCandidate, SessionDescription},
};

pub use self::peer_connection::{RtcEngine, RtcEngineConfig};

/// The media engine the negotiation drives.
///
/// Implementations own connectivity, encryption and media. Every method is
/// awaited from the single negotiation task, so at most one call is
/// outstanding at a time.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Checks that a received description can be applied at all, without
    /// touching the signaling state.
    fn validate_description(&self, desc: &SessionDescription) -> Result<()>;
    /// Discards the pending local offer.
    async fn rollback_local(&self) -> Result<()>;
    /// Discards the pending remote offer.
    async fn rollback_remote(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Called once the relay paired us. The impolite side opens the data
    /// channel here, which in turn requests negotiation.
    async fn start_session(&self, role: NegotiationRole) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for EngineConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Text message channel riding on the established data channel.
///
/// `receiver` yields `None` once the data channel closed.
#[derive(new)]
pub struct CommandChannel {
    pub sender: mpsc::Sender<String>,
    pub receiver: mpsc::Receiver<String>,
}

impl CommandChannel {
    /// Two channels wired to each other.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }
}

/// Asynchronous notifications from the media engine.
pub enum EngineEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    DataChannelOpen(CommandChannel),
    ConnectionStateChanged(EngineConnectionState),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            Self::LocalCandidate(candidate) => write!(f, "LocalCandidate({:?})", candidate),
            Self::DataChannelOpen(_) => write!(f, "DataChannelOpen"),
            Self::ConnectionStateChanged(state) => write!(f, "ConnectionStateChanged({})", state),
        }
    }
}
