use std::{fmt, future::pending, sync::Arc, time::Duration};

use tokio::{
    select, spawn,
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    command::{serve_commands, MediaFlows},
    connection::{EngineConnectionState, EngineEvent, MediaEngine},
    error::{ConnectionError, EndpointError, NegotiationError, ProtocolError},
    negotiation::{NegotiationRole, Negotiator, SignalingState},
    signaling::{socket::SignalingSocket, PeerMessage, RelayMessage},
};

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Registered as is. A random numeric id is used when absent.
    pub our_id: Option<String>,
    /// Called once registered. Without it the endpoint waits to be called.
    pub peer_id: Option<String>,
    pub ping_interval: Duration,
    /// Registrations tried with fresh random ids before giving up.
    pub registration_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            our_id: None,
            peer_id: None,
            ping_interval: Duration::from_secs(2),
            registration_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointPhase {
    Connected,
    Registering,
    Registered,
    Calling,
    InSession(NegotiationRole),
    Closed,
}

impl fmt::Display for EndpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Registering => write!(f, "registering"),
            Self::Registered => write!(f, "registered"),
            Self::Calling => write!(f, "calling"),
            Self::InSession(role) => write!(f, "in session ({})", role),
            Self::Closed => write!(f, "closed"),
        }
    }
}

pub fn random_id() -> String {
    (Uuid::new_v4().as_u128() % 9990 + 10).to_string()
}

async fn join_commands(commands: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match commands {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

/// One endpoint talking to the relay: registers, pairs, negotiates and
/// serves the data channel until the session ends.
pub struct Endpoint<S: SignalingSocket, E: MediaEngine + ?Sized> {
    socket: S,
    engine: Arc<E>,
    engine_events: mpsc::Receiver<EngineEvent>,
    flows: Arc<dyn MediaFlows>,
    config: EndpointConfig,
    our_id: String,
    registrations: u32,
    phase_tx: watch::Sender<EndpointPhase>,
    state_tx: watch::Sender<SignalingState>,
    negotiator: Option<Negotiator<E>>,
    outgoing_tx: mpsc::UnboundedSender<PeerMessage>,
    outgoing_rx: mpsc::UnboundedReceiver<PeerMessage>,
    commands: Option<JoinHandle<()>>,
}

impl<S: SignalingSocket, E: MediaEngine + ?Sized> Endpoint<S, E> {
    pub fn new(
        socket: S,
        engine: Arc<E>,
        engine_events: mpsc::Receiver<EngineEvent>,
        flows: Arc<dyn MediaFlows>,
        config: EndpointConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(EndpointPhase::Connected);
        let (state_tx, _) = watch::channel(SignalingState::Stable);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            socket,
            engine,
            engine_events,
            flows,
            config,
            our_id: String::new(),
            registrations: 0,
            phase_tx,
            state_tx,
            negotiator: None,
            outgoing_tx,
            outgoing_rx,
            commands: None,
        }
    }

    pub fn phase(&self) -> EndpointPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<EndpointPhase> {
        self.phase_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingState> {
        self.state_tx.subscribe()
    }

    fn set_phase(&self, phase: EndpointPhase) {
        debug!("phase {} -> {}", self.phase(), phase);
        self.phase_tx.send_replace(phase);
    }

    fn sync_state(&self) {
        if let Some(negotiator) = &self.negotiator {
            self.state_tx.send_replace(negotiator.state());
        }
    }

    fn report(&self, result: Result<(), NegotiationError>) {
        self.sync_state();
        if let Err(err) = result {
            warn!("negotiation failed: {}", err);
        }
    }

    async fn send(&mut self, msg: RelayMessage) -> Result<(), ConnectionError> {
        self.socket.send(msg.to_string()).await
    }

    /// Runs until the session ends. Returns `Ok` when the peer or the data
    /// channel closed the session.
    pub async fn run(mut self) -> Result<(), EndpointError> {
        let result = self.event_loop().await;
        self.teardown().await;
        if let Err(err) = &result {
            error!("{}", err);
        }
        result
    }

    async fn event_loop(&mut self) -> Result<(), EndpointError> {
        self.register().await?;
        loop {
            select! {
                msg = self.socket.recv() => {
                    let Some(text) = msg? else {
                        return Err(ConnectionError::Closed.into());
                    };
                    if self.handle_relay_message(&text).await? {
                        return Ok(());
                    }
                }
                Some(event) = self.engine_events.recv() => {
                    self.handle_engine_event(event).await?;
                }
                Some(msg) = self.outgoing_rx.recv() => {
                    self.socket.send(msg.to_string()).await?;
                }
                result = join_commands(&mut self.commands) => {
                    self.commands = None;
                    if let Err(err) = result {
                        error!("command task failed: {}", err);
                        return Err(EndpointError::Call(format!("command task failed: {}", err)));
                    }
                    info!("session ended by data channel close");
                    return Ok(());
                }
            }
        }
    }

    async fn register(&mut self) -> Result<(), EndpointError> {
        self.our_id = self.config.our_id.clone().unwrap_or_else(random_id);
        self.registrations += 1;
        self.set_phase(EndpointPhase::Registering);
        info!("registering as {}", self.our_id);
        self.send(RelayMessage::Hello(Some(self.our_id.clone())))
            .await?;
        Ok(())
    }

    /// Returns `true` once the session is over.
    async fn handle_relay_message(&mut self, text: &str) -> Result<bool, EndpointError> {
        let msg = RelayMessage::parse(text);
        let phase = self.phase();
        match msg {
            RelayMessage::Hello(None) => {
                if phase != EndpointPhase::Registering {
                    return Err(ProtocolError::out_of_sequence("HELLO", phase).into());
                }
                info!("registered as {}", self.our_id);
                self.set_phase(EndpointPhase::Registered);
                if let Some(peer_id) = self.config.peer_id.clone() {
                    info!("calling {}", peer_id);
                    self.set_phase(EndpointPhase::Calling);
                    self.send(RelayMessage::Session(peer_id)).await?;
                }
            }
            RelayMessage::SessionOk => {
                if phase != EndpointPhase::Calling {
                    return Err(ProtocolError::out_of_sequence("SESSION_OK", phase).into());
                }
                self.start_session(NegotiationRole::Impolite).await?;
            }
            RelayMessage::Session(peer_id) => {
                if phase != EndpointPhase::Registered {
                    return Err(ProtocolError::out_of_sequence("SESSION", phase).into());
                }
                info!("called by {}", peer_id);
                self.start_session(NegotiationRole::Polite).await?;
            }
            RelayMessage::SessionClosed => {
                if matches!(phase, EndpointPhase::InSession(_)) {
                    info!("peer closed the session");
                    return Ok(true);
                }
                warn!("ignore SESSION_CLOSED while {}", phase);
            }
            RelayMessage::OfferRequest => {
                let Some(negotiator) = &mut self.negotiator else {
                    warn!("ignore OFFER_REQUEST while {}", phase);
                    return Ok(false);
                };
                let result = negotiator.on_negotiation_needed().await;
                self.report(result);
            }
            RelayMessage::Error(reason) => self.handle_relay_error(reason).await?,
            RelayMessage::Hello(Some(_)) | RelayMessage::SessionEnd => {
                warn!("{}", ProtocolError::out_of_sequence(text, phase));
            }
            RelayMessage::Payload(text) => {
                let Some(negotiator) = &mut self.negotiator else {
                    warn!("drop payload received while {}", phase);
                    return Ok(false);
                };
                match PeerMessage::parse(&text) {
                    Ok(msg) => {
                        let result = negotiator.handle_remote_message(msg).await;
                        self.report(result);
                    }
                    Err(err) => warn!("drop payload: {}", err),
                }
            }
        }
        Ok(false)
    }

    async fn handle_relay_error(&mut self, reason: String) -> Result<(), EndpointError> {
        match self.phase() {
            EndpointPhase::Connected | EndpointPhase::Registering => {
                let random = self.config.our_id.is_none();
                if random && self.registrations < self.config.registration_attempts {
                    warn!("registration as {} failed: {}", self.our_id, reason);
                    return self.register().await;
                }
                Err(EndpointError::Registration(reason))
            }
            EndpointPhase::Registered | EndpointPhase::Calling => {
                Err(EndpointError::PeerConnection(reason))
            }
            EndpointPhase::InSession(_) | EndpointPhase::Closed => Err(EndpointError::Call(reason)),
        }
    }

    async fn start_session(&mut self, role: NegotiationRole) -> Result<(), EndpointError> {
        info!("session started as {}", role);
        self.set_phase(EndpointPhase::InSession(role));
        self.negotiator = Some(Negotiator::new(
            self.engine.clone(),
            role,
            self.outgoing_tx.clone(),
        ));
        self.sync_state();
        self.engine
            .start_session(role)
            .await
            .map_err(|err| EndpointError::PeerConnection(format!("{:#}", err)))
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), EndpointError> {
        match event {
            EngineEvent::NegotiationNeeded => {
                let Some(negotiator) = &mut self.negotiator else {
                    debug!("ignore negotiation request outside a session");
                    return Ok(());
                };
                let result = negotiator.on_negotiation_needed().await;
                self.report(result);
            }
            EngineEvent::LocalCandidate(candidate) => {
                match &self.negotiator {
                    Some(negotiator) => negotiator.on_local_candidate(candidate),
                    None => debug!("drop local candidate outside a session"),
                }
            }
            EngineEvent::DataChannelOpen(channel) => {
                if let Some(previous) = self.commands.take() {
                    previous.abort();
                }
                self.commands = Some(spawn(serve_commands(
                    channel,
                    self.flows.clone(),
                    self.config.ping_interval,
                )));
            }
            EngineEvent::ConnectionStateChanged(state) => {
                info!("peer connection {}", state);
                if state == EngineConnectionState::Failed {
                    return Err(EndpointError::PeerConnection(
                        "peer connection failed".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(commands) = self.commands.take() {
            commands.abort();
        }
        if let Some(negotiator) = &mut self.negotiator {
            negotiator.close().await;
        }
        self.sync_state();
        self.set_phase(EndpointPhase::Closed);
    }
}
