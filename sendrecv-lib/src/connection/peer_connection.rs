use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::{
    spawn,
    sync::{mpsc, Mutex},
    time::sleep,
};
use tracing::{debug, info, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::MediaEngine as CodecRegistry, setting_engine::SettingEngine, APIBuilder,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::sdp_type::RTCSdpType, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    stats::StatsReportType,
    track::track_remote::TrackRemote,
};

use crate::{
    negotiation::NegotiationRole,
    signaling::{IceCandidate, SdpType, SessionDescription},
};

use super::{data_channel, EngineConnectionState, EngineEvent, MediaEngine};

pub const DATA_CHANNEL_LABEL: &str = "channel";

#[derive(Clone, Debug)]
pub struct RtcEngineConfig {
    pub stun_servers: Vec<String>,
    pub ice_failed_timeout: Duration,
    /// Period of the debug-level statistics log. Zero disables it.
    pub stats_interval: Duration,
}

impl Default for RtcEngineConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            ice_failed_timeout: Duration::from_secs(20 * 60),
            stats_interval: Duration::from_secs(5),
        }
    }
}

async fn create_peer_connection(config: &RtcEngineConfig) -> Result<RTCPeerConnection> {
    let mut codecs = CodecRegistry::default();
    codecs.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut codecs)?;
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_timeouts(None, Some(config.ice_failed_timeout), None);
    let ice_servers = if config.stun_servers.is_empty() {
        vec![]
    } else {
        vec![RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        }]
    };
    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build()
        .new_peer_connection(rtc_config)
        .await?)
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => Ok(RTCSessionDescription::offer(desc.sdp)?),
        SdpType::Answer => Ok(RTCSessionDescription::answer(desc.sdp)?),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => anyhow::bail!("unexpected description type {}", other),
    }
}

fn to_connection_state(state: RTCPeerConnectionState) -> EngineConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            EngineConnectionState::New
        }
        RTCPeerConnectionState::Connecting => EngineConnectionState::Connecting,
        RTCPeerConnectionState::Connected => EngineConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => EngineConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => EngineConnectionState::Failed,
        RTCPeerConnectionState::Closed => EngineConnectionState::Closed,
    }
}

fn log_stats(report: &webrtc::stats::StatsReport) {
    for stats in report.reports.values() {
        match stats {
            StatsReportType::CandidatePair(pair) if pair.nominated => debug!(
                "candidate pair {}: sent {} bytes, received {} bytes, rtt {:.3}s",
                pair.state, pair.bytes_sent, pair.bytes_received, pair.current_round_trip_time
            ),
            StatsReportType::InboundRTP(rtp) => debug!(
                "inbound {} ssrc {}: {} packets",
                rtp.kind, rtp.ssrc, rtp.packets_received
            ),
            StatsReportType::OutboundRTP(rtp) => debug!(
                "outbound {} ssrc {}: {} packets, {} bytes",
                rtp.kind, rtp.ssrc, rtp.packets_sent, rtp.bytes_sent
            ),
            _ => {}
        }
    }
}

/// Logs statistics until the connection is dropped or closed.
async fn poll_stats(rtc: Weak<RTCPeerConnection>, interval: Duration) {
    loop {
        sleep(interval).await;
        let Some(rtc) = rtc.upgrade() else {
            return;
        };
        if rtc.connection_state() == RTCPeerConnectionState::Closed {
            return;
        }
        log_stats(&rtc.get_stats().await);
    }
}

/// [`MediaEngine`] backed by a native webrtc peer connection.
///
/// The webrtc crate has no rollback transition, so a local offer is held
/// back until its answer arrives and is applied right before that answer.
/// Rolling back the local offer then means forgetting it. A remote offer
/// cannot be rolled back.
pub struct RtcEngine {
    rtc: Arc<RTCPeerConnection>,
    events: mpsc::Sender<EngineEvent>,
    remote_video_track: Arc<Mutex<Option<Arc<TrackRemote>>>>,
    held_offer: Mutex<Option<RTCSessionDescription>>,
}

impl Drop for RtcEngine {
    fn drop(&mut self) {
        trace!("drop engine");
        let rtc = self.rtc.clone();
        // NOTE: An established connection is not disconnected by drop,
        //       so close it explicitly.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let _ = rtc.close().await;
                trace!("connection closed");
            });
        }
    }
}

impl RtcEngine {
    pub async fn new(config: RtcEngineConfig) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        let rtc = Arc::new(
            create_peer_connection(&config)
                .await
                .context("Failed to create peer connection")?,
        );
        let (events, events_rx) = mpsc::channel(32);
        let remote_video_track = Arc::new(Mutex::new(None));

        {
            let events = events.clone();
            rtc.on_negotiation_needed(Box::new(move || {
                let events = events.clone();
                Box::pin(async move {
                    debug!("on_negotiation_needed");
                    let _ = events.send(EngineEvent::NegotiationNeeded).await;
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering and is not relayed.
                    let Some(candidate) = candidate else {
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(err) => {
                            warn!("Failed to serialize local candidate: {}", err);
                            return;
                        }
                    };
                    let candidate = IceCandidate {
                        candidate: init.candidate,
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                    };
                    let _ = events.send(EngineEvent::LocalCandidate(candidate)).await;
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_peer_connection_state_change(Box::new(move |state| {
                let events = events.clone();
                Box::pin(async move {
                    debug!("on_peer_connection_state_change {}", state);
                    let state = to_connection_state(state);
                    let _ = events
                        .send(EngineEvent::ConnectionStateChanged(state))
                        .await;
                })
            }));
        }
        {
            let events = events.clone();
            rtc.on_data_channel(Box::new(move |rtc_data_channel| {
                let events = events.clone();
                Box::pin(async move {
                    info!("remote opened data channel {}", rtc_data_channel.label());
                    data_channel::attach(rtc_data_channel, events).await;
                })
            }));
        }
        rtc.on_ice_gathering_state_change(Box::new(|state| {
            info!("ice gathering {}", state);
            Box::pin(async {})
        }));
        {
            let remote_video_track = remote_video_track.clone();
            rtc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let remote_video_track = remote_video_track.clone();
                Box::pin(async move {
                    info!("remote track {} ({})", track.id(), track.kind());
                    if track.kind() == RTPCodecType::Video {
                        *remote_video_track.lock().await = Some(track);
                    }
                })
            }));
        }

        if !config.stats_interval.is_zero() {
            spawn(poll_stats(Arc::downgrade(&rtc), config.stats_interval));
        }

        Ok((
            Self {
                rtc,
                events,
                remote_video_track,
                held_offer: Mutex::new(None),
            },
            events_rx,
        ))
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.rtc
    }

    /// Latest video track sent by the remote peer.
    pub async fn remote_video_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_video_track.lock().await.clone()
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.rtc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.rtc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        if desc.sdp_type == RTCSdpType::Offer {
            debug!("hold local offer until answered");
            *self.held_offer.lock().await = Some(desc);
            return Ok(());
        }
        Ok(self.rtc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        let mut held_offer = self.held_offer.lock().await;
        match desc.sdp_type {
            RTCSdpType::Offer if held_offer.is_some() => {
                bail!("a local offer is pending")
            }
            RTCSdpType::Answer => {
                let Some(offer) = held_offer.take() else {
                    bail!("no local offer to answer");
                };
                self.rtc
                    .set_local_description(offer)
                    .await
                    .context("Failed to apply local offer")?;
            }
            _ => {}
        }
        Ok(self.rtc.set_remote_description(desc).await?)
    }

    fn validate_description(&self, desc: &SessionDescription) -> Result<()> {
        to_rtc_description(desc.clone())?;
        Ok(())
    }

    async fn rollback_local(&self) -> Result<()> {
        if self.held_offer.lock().await.take().is_none() {
            bail!("no local offer to roll back");
        }
        Ok(())
    }

    async fn rollback_remote(&self) -> Result<()> {
        bail!(
            "cannot roll back a remote offer while {}",
            self.rtc.signaling_state()
        )
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        Ok(self
            .rtc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                ..Default::default()
            })
            .await?)
    }

    async fn start_session(&self, role: NegotiationRole) -> Result<()> {
        if role == NegotiationRole::Polite {
            // The remote side opens the data channel.
            return Ok(());
        }
        // Lets the first offer ask for the peer's video.
        self.rtc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("Failed to add video transceiver")?;
        let rtc_data_channel = self
            .rtc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .context("Failed to create data channel")?;
        data_channel::attach(rtc_data_channel, self.events.clone()).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.rtc.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    use crate::{
        negotiation::{Negotiator, SignalingState},
        signaling::PeerMessage,
    };

    use super::*;

    struct Side {
        engine: Arc<RtcEngine>,
        negotiator: Negotiator<RtcEngine>,
        outgoing: UnboundedReceiver<PeerMessage>,
    }

    async fn side(role: NegotiationRole) -> Side {
        let (engine, _events) = RtcEngine::new(RtcEngineConfig {
            stun_servers: vec![],
            stats_interval: Duration::ZERO,
            ..Default::default()
        })
        .await
        .unwrap();
        let engine = Arc::new(engine);
        let (tx, rx) = unbounded_channel();
        Side {
            negotiator: Negotiator::new(engine.clone(), role, tx),
            engine,
            outgoing: rx,
        }
    }

    /// Delivers descriptions both ways until both sides are quiet. Local
    /// candidates are not relayed.
    async fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let mut delivered = false;
            while let Ok(msg) = a.outgoing.try_recv() {
                b.negotiator.handle_remote_message(msg).await.unwrap();
                delivered = true;
            }
            while let Ok(msg) = b.outgoing.try_recv() {
                a.negotiator.handle_remote_message(msg).await.unwrap();
                delivered = true;
            }
            if !delivered {
                break;
            }
        }
    }

    fn assert_stable(side: &Side) {
        assert_eq!(side.negotiator.state(), SignalingState::Stable);
        assert_eq!(
            side.engine.peer_connection().signaling_state(),
            RTCSignalingState::Stable
        );
    }

    #[tokio::test]
    async fn test_offer_answer() {
        let mut a = side(NegotiationRole::Impolite).await;
        let mut b = side(NegotiationRole::Polite).await;

        a.engine
            .start_session(NegotiationRole::Impolite)
            .await
            .unwrap();
        a.negotiator.on_negotiation_needed().await.unwrap();
        assert_eq!(a.negotiator.state(), SignalingState::HaveLocalOffer);

        pump(&mut a, &mut b).await;
        assert_stable(&a);
        assert_stable(&b);
        let offer = b.engine.peer_connection().remote_description().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
    }

    #[tokio::test]
    async fn test_glare_resolves() {
        let mut a = side(NegotiationRole::Impolite).await;
        let mut b = side(NegotiationRole::Polite).await;

        a.engine
            .start_session(NegotiationRole::Impolite)
            .await
            .unwrap();
        b.engine
            .peer_connection()
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        a.negotiator.on_negotiation_needed().await.unwrap();
        b.negotiator.on_negotiation_needed().await.unwrap();
        let offer_a = a.outgoing.try_recv().unwrap();
        let offer_b = b.outgoing.try_recv().unwrap();

        a.negotiator.handle_remote_message(offer_b).await.unwrap();
        assert_eq!(a.negotiator.state(), SignalingState::HaveLocalOffer);
        b.negotiator.handle_remote_message(offer_a).await.unwrap();

        pump(&mut a, &mut b).await;
        assert_stable(&a);
        assert_stable(&b);
        assert!(!b.negotiator.is_renegotiation_deferred());
        let offer_b = a.engine.peer_connection().remote_description().await.unwrap();
        assert!(offer_b.sdp.contains("m=audio"));
    }

    #[tokio::test]
    async fn test_rollback_without_local_offer_fails() {
        let a = side(NegotiationRole::Impolite).await;
        assert!(a.engine.rollback_local().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_description_is_invalid() {
        let a = side(NegotiationRole::Impolite).await;
        a.engine
            .start_session(NegotiationRole::Impolite)
            .await
            .unwrap();
        assert!(a
            .engine
            .validate_description(&SessionDescription::offer("garbage".to_owned()))
            .is_err());
        let offer = a.engine.create_offer().await.unwrap();
        assert!(a.engine.validate_description(&offer).is_ok());
    }
}
