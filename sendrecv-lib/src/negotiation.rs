use std::{fmt, sync::Arc};

use getset::CopyGetters;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    candidate::CandidateRelay,
    connection::MediaEngine,
    error::NegotiationError,
    signaling::{IceCandidate, PeerMessage, SdpType, SessionDescription},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Yields to the remote offer on glare.
    Polite,
    /// Keeps its own offer on glare.
    Impolite,
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polite => write!(f, "polite"),
            Self::Impolite => write!(f, "impolite"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::HaveLocalPranswer => "have-local-pranswer",
            Self::HaveRemotePranswer => "have-remote-pranswer",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Perfect negotiation over a [`MediaEngine`].
///
/// Owned by a single task; every method awaits its engine calls before
/// returning, so engine operations never overlap. Outgoing descriptions and
/// candidates are pushed to `outgoing` in the order they are produced.
#[derive(CopyGetters)]
pub struct Negotiator<E: MediaEngine + ?Sized> {
    engine: Arc<E>,
    #[getset(get_copy = "pub")]
    role: NegotiationRole,
    #[getset(get_copy = "pub")]
    state: SignalingState,
    making_offer: bool,
    renegotiation_deferred: bool,
    candidates: CandidateRelay,
    outgoing: mpsc::UnboundedSender<PeerMessage>,
    state_tx: watch::Sender<SignalingState>,
}

impl<E: MediaEngine + ?Sized> Negotiator<E> {
    pub fn new(
        engine: Arc<E>,
        role: NegotiationRole,
        outgoing: mpsc::UnboundedSender<PeerMessage>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SignalingState::Stable);
        Self {
            engine,
            role,
            state: SignalingState::Stable,
            making_offer: false,
            renegotiation_deferred: false,
            candidates: CandidateRelay::new(),
            outgoing,
            state_tx,
        }
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn is_renegotiation_deferred(&self) -> bool {
        self.renegotiation_deferred
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending_len()
    }

    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: SignalingState) {
        if self.state != state {
            debug!("signaling state {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn send(&self, msg: PeerMessage) {
        if self.outgoing.send(msg).is_err() {
            warn!("outgoing signaling queue is closed");
        }
    }

    /// The engine asks for (re)negotiation. Deferred until stable.
    pub async fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        if self.state != SignalingState::Stable || self.making_offer {
            debug!("defer negotiation while {}", self.state);
            self.renegotiation_deferred = true;
            return Ok(());
        }
        self.making_offer = true;
        let result = self.make_offer().await;
        self.making_offer = false;
        result
    }

    async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self
            .engine
            .create_offer()
            .await
            .map_err(NegotiationError::engine("create_offer"))?;
        self.engine
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::engine("set_local_description"))?;
        self.set_state(SignalingState::HaveLocalOffer);
        self.send(PeerMessage::Sdp(offer));
        Ok(())
    }

    pub async fn handle_remote_message(&mut self, msg: PeerMessage) -> Result<(), NegotiationError> {
        match msg {
            PeerMessage::Sdp(desc) => self.handle_remote_description(desc).await,
            PeerMessage::Ice(candidate) => self.handle_remote_candidate(candidate).await,
        }
    }

    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        self.candidates
            .on_remote_candidate(self.engine.as_ref(), candidate)
            .await;
        Ok(())
    }

    pub async fn handle_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        self.engine
            .validate_description(&desc)
            .map_err(NegotiationError::engine("validate_description"))?;
        match desc.sdp_type {
            SdpType::Offer => self.handle_remote_offer(desc).await,
            SdpType::Answer => self.handle_remote_answer(desc).await,
        }
    }

    async fn handle_remote_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let collision = self.making_offer || self.state != SignalingState::Stable;
        if collision {
            if self.role == NegotiationRole::Impolite {
                info!("ignore colliding offer while {}", self.state);
                return Ok(());
            }
            if self.state != SignalingState::Stable {
                info!("roll back local offer on collision");
                self.engine
                    .rollback_local()
                    .await
                    .map_err(NegotiationError::engine("rollback_local"))?;
                self.set_state(SignalingState::Stable);
            }
            self.renegotiation_deferred = true;
        }

        if let Err(err) = self.engine.set_remote_description(offer).await {
            // Our own offer may have been rolled back for this one; send it again.
            let err = NegotiationError::engine("set_remote_description")(err);
            if let Err(retry_err) = self.run_deferred().await {
                warn!("Failed to offer again: {}", retry_err);
            }
            return Err(err);
        }
        self.set_state(SignalingState::HaveRemoteOffer);
        self.candidates
            .on_remote_description_applied(self.engine.as_ref())
            .await;

        if let Err(err) = self.answer().await {
            // Leave the offer unanswered and return to where we were.
            match self.engine.rollback_remote().await {
                Ok(()) => self.set_state(SignalingState::Stable),
                Err(rollback_err) => warn!("Failed to roll back remote offer: {:#}", rollback_err),
            }
            return Err(err);
        }
        self.run_deferred().await
    }

    async fn answer(&mut self) -> Result<(), NegotiationError> {
        let answer = self
            .engine
            .create_answer()
            .await
            .map_err(NegotiationError::engine("create_answer"))?;
        self.engine
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::engine("set_local_description"))?;
        self.set_state(SignalingState::Stable);
        self.send(PeerMessage::Sdp(answer));
        Ok(())
    }

    async fn handle_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state != SignalingState::HaveLocalOffer {
            warn!("discard answer received while {}", self.state);
            return Ok(());
        }
        self.engine
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::engine("set_remote_description"))?;
        self.candidates
            .on_remote_description_applied(self.engine.as_ref())
            .await;
        self.set_state(SignalingState::Stable);
        self.run_deferred().await
    }

    async fn run_deferred(&mut self) -> Result<(), NegotiationError> {
        if !self.renegotiation_deferred || self.state != SignalingState::Stable {
            return Ok(());
        }
        self.renegotiation_deferred = false;
        debug!("run deferred negotiation");
        self.on_negotiation_needed().await
    }

    /// Relays a candidate gathered by the local engine.
    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.state == SignalingState::Closed {
            return;
        }
        self.send(PeerMessage::Ice(candidate));
    }

    /// Terminal. Pending candidates are dropped and the engine is closed.
    pub async fn close(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }
        self.set_state(SignalingState::Closed);
        self.making_offer = false;
        self.renegotiation_deferred = false;
        self.candidates.discard();
        if let Err(err) = self.engine.close().await {
            warn!("Failed to close media engine: {:#}", err);
        }
    }
}
