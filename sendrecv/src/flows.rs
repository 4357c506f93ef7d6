use std::{collections::HashMap, io::Cursor, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sendrecv_lib::{
    command::{FlowSource, MediaFlows, MediaKind},
    connection::RtcEngine,
};
use tokio::{fs, spawn, sync::Mutex, task::JoinHandle, time::interval};
use tracing::{debug, info, warn};
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::{io::ivf_reader::IVFReader, Sample},
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender},
    track::{
        track_local::{
            track_local_static_rtp::TrackLocalStaticRTP,
            track_local_static_sample::TrackLocalStaticSample, TrackLocal, TrackLocalWriter,
        },
        track_remote::TrackRemote,
    },
};

const STREAM_ID: &str = "sendrecv";
/// One Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

fn vp8() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        ..Default::default()
    }
}

fn opus() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    }
}

/// One tick of an IVF timebase.
fn frame_duration(numerator: u32, denominator: u32) -> Result<Duration> {
    if numerator == 0 || denominator == 0 {
        bail!("invalid IVF timebase {}/{}", numerator, denominator);
    }
    Ok(Duration::from_secs_f64(numerator as f64 / denominator as f64))
}

/// Replays an IVF file in a loop, paced by its timebase.
async fn replay_ivf(track: Arc<TrackLocalStaticSample>, data: Bytes) -> Result<()> {
    loop {
        let (mut reader, header) = IVFReader::new(Cursor::new(data.clone()))?;
        let frame_duration =
            frame_duration(header.timebase_numerator, header.timebase_denominator)?;
        let mut ticker = interval(frame_duration);
        while let Ok((frame, _)) = reader.parse_next_frame() {
            ticker.tick().await;
            track
                .write_sample(&Sample {
                    data: frame.freeze(),
                    duration: frame_duration,
                    ..Default::default()
                })
                .await?;
        }
        debug!("test pattern restarts");
    }
}

async fn forward_rtp(remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) {
    while let Ok((packet, _)) = remote.read_rtp().await {
        if let Err(err) = local.write_rtp(&packet).await {
            if err == webrtc::Error::ErrClosedPipe {
                return;
            }
            warn!("Failed to loop back packet: {}", err);
        }
    }
    debug!("remote video track ended");
}

async fn send_silence(track: Arc<TrackLocalStaticSample>) -> Result<()> {
    let mut ticker = interval(OPUS_FRAME_DURATION);
    loop {
        ticker.tick().await;
        track
            .write_sample(&Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: OPUS_FRAME_DURATION,
                ..Default::default()
            })
            .await?;
    }
}

fn spawn_logged(name: &'static str, task: impl std::future::Future<Output = Result<()>> + Send + 'static) -> JoinHandle<()> {
    spawn(async move {
        if let Err(err) = task.await {
            warn!("{} stopped: {:#}", name, err);
        }
    })
}

struct ActiveFlow {
    sender: Arc<RTCRtpSender>,
    task: JoinHandle<()>,
}

/// Media flows sent to the peer through tracks of the native engine.
pub struct RtcMediaFlows {
    engine: Arc<RtcEngine>,
    test_pattern: Option<PathBuf>,
    active: Mutex<HashMap<MediaKind, ActiveFlow>>,
}

impl Drop for RtcMediaFlows {
    fn drop(&mut self) {
        for flow in self.active.get_mut().values() {
            flow.task.abort();
        }
    }
}

impl RtcMediaFlows {
    pub fn new(engine: Arc<RtcEngine>, test_pattern: Option<PathBuf>) -> Self {
        Self {
            engine,
            test_pattern,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Adding a track makes the engine ask for renegotiation.
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<Arc<RTCRtpSender>> {
        let sender = self
            .engine
            .peer_connection()
            .add_track(track)
            .await
            .context("Failed to add track")?;
        // NOTE: Interceptors only process RTCP while it is being read.
        let rtcp_sender = sender.clone();
        spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        Ok(sender)
    }

    async fn start_test_pattern(&self) -> Result<ActiveFlow> {
        let path = self
            .test_pattern
            .as_ref()
            .context("no test pattern file is configured")?;
        let data = fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let track = Arc::new(TrackLocalStaticSample::new(
            vp8(),
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self.add_track(track.clone()).await?;
        let task = spawn_logged("test pattern", replay_ivf(track, Bytes::from(data)));
        Ok(ActiveFlow { sender, task })
    }

    async fn start_loopback(&self) -> Result<ActiveFlow> {
        let remote = self
            .engine
            .remote_video_track()
            .await
            .context("no remote video track to loop back")?;
        let track = Arc::new(TrackLocalStaticRTP::new(
            vp8(),
            "video-loopback".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self.add_track(track.clone()).await?;
        let task = spawn(forward_rtp(remote, track));
        Ok(ActiveFlow { sender, task })
    }

    async fn start_tone(&self) -> Result<ActiveFlow> {
        let track = Arc::new(TrackLocalStaticSample::new(
            opus(),
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self.add_track(track.clone()).await?;
        let task = spawn_logged("audio", send_silence(track));
        Ok(ActiveFlow { sender, task })
    }
}

#[async_trait]
impl MediaFlows for RtcMediaFlows {
    async fn attach(&self, kind: MediaKind, source: FlowSource) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.contains_key(&kind) {
            bail!("{} flow is already attached", kind);
        }
        let flow = match (kind, source) {
            (MediaKind::Video, FlowSource::TestPattern) => self.start_test_pattern().await?,
            (MediaKind::Video, FlowSource::Loopback) => self.start_loopback().await?,
            (MediaKind::Audio, _) => self.start_tone().await?,
        };
        info!("attached {} {}", kind, source);
        active.insert(kind, flow);
        Ok(())
    }

    async fn detach(&self, kind: MediaKind) -> Result<()> {
        let Some(flow) = self.active.lock().await.remove(&kind) else {
            return Ok(());
        };
        flow.task.abort();
        self.engine
            .peer_connection()
            .remove_track(&flow.sender)
            .await
            .context("Failed to remove track")?;
        info!("detached {}", kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        assert_eq!(frame_duration(1, 30).unwrap(), Duration::from_secs_f64(1.0 / 30.0));
        let tick = frame_duration(1, 90000).unwrap();
        assert!(!tick.is_zero());
        assert!(tick < Duration::from_millis(1));
        assert!(frame_duration(1, 0).is_err());
        assert!(frame_duration(0, 30).is_err());
    }
}
