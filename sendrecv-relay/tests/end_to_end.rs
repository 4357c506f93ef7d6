use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use sendrecv_lib::{
    command::{FlowSource, MediaFlows, MediaKind},
    endpoint::{Endpoint, EndpointConfig, EndpointPhase},
    error::EndpointError,
    negotiation::{NegotiationRole, SignalingState},
    signaling::{
        client::{connect_with_retries, RelaySocket},
        IceCandidate, SdpType,
    },
    testing::{EngineOp, ScriptedEngine},
};
use sendrecv_relay::{registry::PeerRegistry, server::serve};
use tokio::{
    net::TcpListener,
    spawn,
    sync::{watch, Mutex},
    time::{sleep, timeout},
};

struct NoFlows;

#[async_trait]
impl MediaFlows for NoFlows {
    async fn attach(&self, _kind: MediaKind, _source: FlowSource) -> Result<()> {
        Ok(())
    }

    async fn detach(&self, _kind: MediaKind) -> Result<()> {
        Ok(())
    }
}

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn(serve(listener, Arc::new(Mutex::new(PeerRegistry::new()))));
    format!("ws://{}", addr)
}

async fn endpoint(
    url: &str,
    name: &str,
    our_id: &str,
    peer_id: Option<&str>,
) -> (Endpoint<RelaySocket, ScriptedEngine>, Arc<ScriptedEngine>) {
    let socket = connect_with_retries(url, 3, Duration::from_millis(100))
        .await
        .unwrap();
    let (engine, events) = ScriptedEngine::new(name);
    let engine = Arc::new(engine);
    let config = EndpointConfig {
        our_id: Some(our_id.to_owned()),
        peer_id: peer_id.map(|id| id.to_owned()),
        ..Default::default()
    };
    let endpoint = Endpoint::new(socket, engine.clone(), events, Arc::new(NoFlows), config);
    (endpoint, engine)
}

async fn wait_for_phase(rx: &mut watch::Receiver<EndpointPhase>, phase: EndpointPhase) {
    timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != phase {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_offer_answer_through_relay() {
    let url = start_relay().await;

    let (b, b_engine) = endpoint(&url, "b", "b", None).await;
    let mut b_phase = b.subscribe_phase();
    let b_state = b.subscribe_state();
    let b_task = spawn(b.run());
    wait_for_phase(&mut b_phase, EndpointPhase::Registered).await;

    let (a, a_engine) = endpoint(&url, "a", "a", Some("b")).await;
    let a_state = a.subscribe_state();
    let a_task = spawn(a.run());

    eventually(|| {
        a_engine.ops().contains(&EngineOp::SetRemote(SdpType::Answer))
            && b_engine.ops().contains(&EngineOp::SetLocal(SdpType::Answer))
    })
    .await;
    assert_eq!(*a_state.borrow(), SignalingState::Stable);
    assert_eq!(*b_state.borrow(), SignalingState::Stable);
    assert_eq!(a_engine.local_description(), b_engine.remote_description());
    assert_eq!(b_engine.local_description(), a_engine.remote_description());
    assert_eq!(
        a_engine.ops()[..4],
        [
            EngineOp::StartSession(NegotiationRole::Impolite),
            EngineOp::CreateOffer,
            EngineOp::SetLocal(SdpType::Offer),
            EngineOp::SetRemote(SdpType::Answer),
        ]
    );
    assert_eq!(
        b_engine.ops()[..4],
        [
            EngineOp::StartSession(NegotiationRole::Polite),
            EngineOp::SetRemote(SdpType::Offer),
            EngineOp::CreateAnswer,
            EngineOp::SetLocal(SdpType::Answer),
        ]
    );

    a_engine
        .gather_candidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 5000 typ host".to_owned(),
            sdp_mline_index: 0,
        })
        .await;
    eventually(|| b_engine.applied_candidates().len() == 1).await;

    // A third endpoint cannot call the busy peer.
    let (c, _c_engine) = endpoint(&url, "c", "c", Some("b")).await;
    let result = timeout(Duration::from_secs(5), c.run()).await.unwrap();
    assert!(matches!(
        result,
        Err(EndpointError::PeerConnection(reason)) if reason == "peer b is busy"
    ));

    // Dropping the caller's connection ends the callee's session.
    a_task.abort();
    let result = timeout(Duration::from_secs(5), b_task).await.unwrap();
    result.unwrap().unwrap();
    assert_eq!(*b_phase.borrow(), EndpointPhase::Closed);
    assert!(b_engine.ops().contains(&EngineOp::Close));
}

#[tokio::test]
async fn test_duplicate_identity_is_rejected() {
    let url = start_relay().await;

    let (first, _first_engine) = endpoint(&url, "first", "x", None).await;
    let mut first_phase = first.subscribe_phase();
    let _first_task = spawn(first.run());
    wait_for_phase(&mut first_phase, EndpointPhase::Registered).await;

    let (second, _second_engine) = endpoint(&url, "second", "x", None).await;
    let result = timeout(Duration::from_secs(5), second.run()).await.unwrap();
    assert!(matches!(
        result,
        Err(EndpointError::Registration(reason)) if reason == "identity x is already registered"
    ));
    assert_eq!(*first_phase.borrow(), EndpointPhase::Registered);
}
