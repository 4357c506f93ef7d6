//! In-memory [`MediaEngine`] for driving the negotiation in tests.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    connection::{CommandChannel, EngineEvent, MediaEngine},
    negotiation::{NegotiationRole, SignalingState},
    signaling::{IceCandidate, SdpType, SessionDescription},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    RollbackLocal,
    RollbackRemote,
    AddCandidate(String),
    StartSession(NegotiationRole),
    Close,
}

#[derive(Default)]
struct Inner {
    ops: Vec<EngineOp>,
    seq: u32,
    state: SignalingState,
    local: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    applied_candidates: Vec<String>,
    failing_candidates: Vec<String>,
    fail_next: Vec<&'static str>,
}

/// Records every call and produces minimal SDP text. Remote descriptions
/// that do not start with `v=0` are rejected as malformed, and descriptions
/// applied in the wrong signaling state are rejected like a real engine does.
pub struct ScriptedEngine {
    name: String,
    inner: Mutex<Inner>,
    events: mpsc::Sender<EngineEvent>,
}

impl ScriptedEngine {
    pub fn new(name: &str) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (events, events_rx) = mpsc::channel(32);
        let engine = Self {
            name: name.to_owned(),
            inner: Mutex::new(Inner::default()),
            events,
        };
        (engine, events_rx)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.inner().ops.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner().remote.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner().state
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner().applied_candidates.clone()
    }

    /// The next call of `operation` (a [`MediaEngine`] method name) fails.
    pub fn fail_next(&self, operation: &'static str) {
        self.inner().fail_next.push(operation);
    }

    pub fn fail_candidate(&self, candidate: &str) {
        self.inner().failing_candidates.push(candidate.to_owned());
    }

    /// Emits a local candidate as the engine would after gathering one.
    pub async fn gather_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate)).await;
    }

    /// Opens a data channel and returns the remote end of it.
    pub async fn open_data_channel(&self) -> CommandChannel {
        let (local, remote) = CommandChannel::pair(16);
        let _ = self.events.send(EngineEvent::DataChannelOpen(local)).await;
        remote
    }

    fn begin(&self, op: EngineOp, name: &'static str) -> Result<()> {
        let mut inner = self.inner();
        inner.ops.push(op);
        if let Some(pos) = inner.fail_next.iter().position(|&n| n == name) {
            inner.fail_next.remove(pos);
            bail!("{} failed", name);
        }
        Ok(())
    }

    fn next_sdp(&self) -> String {
        let mut inner = self.inner();
        inner.seq += 1;
        format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
            inner.seq, inner.seq, self.name
        )
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.begin(EngineOp::CreateOffer, "create_offer")?;
        Ok(SessionDescription::offer(self.next_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.begin(EngineOp::CreateAnswer, "create_answer")?;
        if self.inner().remote.is_none() {
            bail!("no remote description to answer");
        }
        Ok(SessionDescription::answer(self.next_sdp()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.begin(EngineOp::SetLocal(desc.sdp_type), "set_local_description")?;
        let mut inner = self.inner();
        inner.state = match (inner.state, desc.sdp_type) {
            (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => {
                inner.stable_local = Some(desc.clone());
                inner.stable_remote = inner.remote.clone();
                SignalingState::Stable
            }
            (state, sdp_type) => bail!("cannot apply local {} while {}", sdp_type, state),
        };
        inner.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.begin(EngineOp::SetRemote(desc.sdp_type), "set_remote_description")?;
        self.validate_description(&desc)?;
        let mut inner = self.inner();
        inner.state = match (inner.state, desc.sdp_type) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => {
                inner.stable_local = inner.local.clone();
                inner.stable_remote = Some(desc.clone());
                SignalingState::Stable
            }
            (state, sdp_type) => bail!("cannot apply remote {} while {}", sdp_type, state),
        };
        inner.remote = Some(desc);
        Ok(())
    }

    fn validate_description(&self, desc: &SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with("v=0") {
            bail!("malformed session description");
        }
        Ok(())
    }

    async fn rollback_local(&self) -> Result<()> {
        self.begin(EngineOp::RollbackLocal, "rollback_local")?;
        let mut inner = self.inner();
        if inner.state != SignalingState::HaveLocalOffer {
            bail!("no local offer to roll back while {}", inner.state);
        }
        inner.state = SignalingState::Stable;
        inner.local = inner.stable_local.clone();
        Ok(())
    }

    async fn rollback_remote(&self) -> Result<()> {
        self.begin(EngineOp::RollbackRemote, "rollback_remote")?;
        let mut inner = self.inner();
        if inner.state != SignalingState::HaveRemoteOffer {
            bail!("no remote offer to roll back while {}", inner.state);
        }
        inner.state = SignalingState::Stable;
        inner.remote = inner.stable_remote.clone();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.begin(
            EngineOp::AddCandidate(candidate.candidate.clone()),
            "add_ice_candidate",
        )?;
        let mut inner = self.inner();
        if inner.failing_candidates.contains(&candidate.candidate) {
            bail!("unreachable candidate");
        }
        inner.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn start_session(&self, role: NegotiationRole) -> Result<()> {
        self.begin(EngineOp::StartSession(role), "start_session")?;
        if role == NegotiationRole::Impolite {
            let _ = self.events.send(EngineEvent::NegotiationNeeded).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.begin(EngineOp::Close, "close")?;
        self.inner().state = SignalingState::Closed;
        Ok(())
    }
}
