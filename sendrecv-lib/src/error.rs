use thiserror::Error;

/// Registration and pairing failures. The relay reports these to the
/// requesting connection as `ERROR <text>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("identity {0} is already registered")]
    DuplicateIdentity(String),
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("peer {0} is not registered")]
    UnknownPeer(String),
    #[error("peer {0} is busy")]
    PeerBusy(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("received SDP without 'type'")]
    MissingSdpType,
    #[error("unsupported SDP type: {0}")]
    UnsupportedSdpType(String),
    #[error("received {message} while {state}")]
    OutOfSequence { message: String, state: String },
    #[error("cannot open a session with yourself")]
    SessionWithSelf,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ProtocolError {
    pub fn out_of_sequence(message: impl ToString, state: impl ToString) -> Self {
        Self::OutOfSequence {
            message: message.to_string(),
            state: state.to_string(),
        }
    }
}

/// A media engine operation failed. The in-flight attempt is aborted and the
/// signaling state is left untouched.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("{operation} failed: {source}")]
    Engine {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("negotiation is closed")]
    Closed,
}

impl NegotiationError {
    pub fn engine(operation: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Engine { operation, source }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("relay connection closed")]
    Closed,
    #[error("relay transport failed: {0}")]
    Transport(String),
    #[error("gave up connecting to {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
}

/// Fatal outcomes of an endpoint run, classified by the phase they happened in.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("peer connection failed: {0}")]
    PeerConnection(String),
    #[error("call failed: {0}")]
    Call(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
