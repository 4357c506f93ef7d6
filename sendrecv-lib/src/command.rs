mod flow_controller;

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{
    select,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{connection::CommandChannel, error::ProtocolError};

pub use flow_controller::FlowController;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "VIDEO"),
            Self::Audio => write!(f, "AUDIO"),
        }
    }
}

/// What a started flow sends. Audio only has a generated source.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FlowSource {
    #[default]
    TestPattern,
    Loopback,
}

impl fmt::Display for FlowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TestPattern => write!(f, "TESTPATTERN"),
            Self::Loopback => write!(f, "LOOPBACK"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelCommand {
    StartFlow(MediaKind, FlowSource),
    StopFlow(MediaKind),
    Ping(u32),
    Pong(u32),
}

static RECV_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^RECV (VIDEO|AUDIO) (START|STOP)(?: (TESTPATTERN|LOOPBACK))?$").unwrap()
});
static PING_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(PING|PONG) (\d+)$").unwrap());

impl DataChannelCommand {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidCommand(text.to_owned());
        if let Some(captures) = PING_PATTERN.captures(text) {
            let seq = captures[2].parse().map_err(|_| invalid())?;
            return Ok(match &captures[1] {
                "PING" => Self::Ping(seq),
                _ => Self::Pong(seq),
            });
        }
        let captures = RECV_PATTERN.captures(text).ok_or_else(invalid)?;
        let kind = match &captures[1] {
            "VIDEO" => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        let source = captures.get(3).map(|m| match m.as_str() {
            "LOOPBACK" => FlowSource::Loopback,
            _ => FlowSource::TestPattern,
        });
        match (&captures[2], kind, source) {
            ("STOP", _, None) => Ok(Self::StopFlow(kind)),
            ("STOP", _, Some(_)) => Err(invalid()),
            (_, MediaKind::Audio, Some(FlowSource::Loopback)) => Err(invalid()),
            (_, _, source) => Ok(Self::StartFlow(kind, source.unwrap_or_default())),
        }
    }
}

impl fmt::Display for DataChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartFlow(MediaKind::Audio, _) => write!(f, "RECV AUDIO START"),
            Self::StartFlow(kind, source) => write!(f, "RECV {} START {}", kind, source),
            Self::StopFlow(kind) => write!(f, "RECV {} STOP", kind),
            Self::Ping(seq) => write!(f, "PING {}", seq),
            Self::Pong(seq) => write!(f, "PONG {}", seq),
        }
    }
}

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Attaches and detaches media flows on the peer connection.
#[async_trait]
pub trait MediaFlows: Send + Sync {
    async fn attach(&self, kind: MediaKind, source: FlowSource) -> Result<()>;
    async fn detach(&self, kind: MediaKind) -> Result<()>;
}

/// Serves the command protocol on an open data channel until it closes.
///
/// Sends `PING <n>` every `ping_interval` and answers every message other
/// than `PONG` with `PONG <k>`, `k` counting the messages received so far
/// starting at 0. Active flows are detached once the channel closes.
pub async fn serve_commands(
    channel: CommandChannel,
    flows: Arc<dyn MediaFlows>,
    ping_interval: Duration,
) {
    let CommandChannel {
        sender,
        mut receiver,
    } = channel;
    let mut controller = FlowController::new(flows);
    let ping_interval = if ping_interval < MIN_PING_INTERVAL {
        warn!("ping interval {:?} is too short, using {:?}", ping_interval, MIN_PING_INTERVAL);
        MIN_PING_INTERVAL
    } else {
        ping_interval
    };
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_seq = 0u32;
    let mut received = 0u32;

    info!("data channel open");
    loop {
        select! {
            _ = ping.tick() => {
                let msg = DataChannelCommand::Ping(ping_seq).to_string();
                if sender.send(msg).await.is_err() {
                    break;
                }
                ping_seq = ping_seq.wrapping_add(1);
            }
            msg = receiver.recv() => {
                let Some(text) = msg else {
                    break;
                };
                debug!("data channel message: {}", text);
                let command = DataChannelCommand::parse(&text);
                if let Ok(DataChannelCommand::Pong(seq)) = command {
                    trace!("pong {}", seq);
                    continue;
                }
                match command {
                    Ok(DataChannelCommand::StartFlow(kind, source)) => controller.start(kind, source),
                    Ok(DataChannelCommand::StopFlow(kind)) => controller.stop(kind),
                    Ok(DataChannelCommand::Ping(_) | DataChannelCommand::Pong(_)) => {}
                    Err(err) => warn!("{}", err),
                }
                let pong = DataChannelCommand::Pong(received).to_string();
                received = received.wrapping_add(1);
                if sender.send(pong).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("data channel closed");
    controller.shutdown().await;
}
