use std::{collections::HashMap, sync::Arc};

use tokio::{spawn, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use super::{FlowSource, MediaFlows, MediaKind};

#[derive(Debug)]
enum FlowOp {
    Attach(MediaKind, FlowSource),
    Detach(MediaKind),
}

/// Tracks the active flows and applies changes on a worker task, so the
/// command loop never waits for the media engine.
pub struct FlowController {
    active: HashMap<MediaKind, FlowSource>,
    ops: mpsc::UnboundedSender<FlowOp>,
    worker: JoinHandle<()>,
}

impl FlowController {
    pub fn new(flows: Arc<dyn MediaFlows>) -> Self {
        let (ops, mut ops_rx) = mpsc::unbounded_channel();
        let worker = spawn(async move {
            while let Some(op) = ops_rx.recv().await {
                debug!("apply {:?}", op);
                let result = match op {
                    FlowOp::Attach(kind, source) => flows.attach(kind, source).await,
                    FlowOp::Detach(kind) => flows.detach(kind).await,
                };
                if let Err(err) = result {
                    warn!("Failed to apply flow change: {:#}", err);
                }
            }
        });
        Self {
            active: HashMap::new(),
            ops,
            worker,
        }
    }

    pub fn active(&self, kind: MediaKind) -> Option<FlowSource> {
        self.active.get(&kind).copied()
    }

    /// Starting the active flow again does nothing; starting another source
    /// replaces it.
    pub fn start(&mut self, kind: MediaKind, source: FlowSource) {
        match self.active.insert(kind, source) {
            Some(current) if current == source => {
                debug!("{} {} is already running", kind, source);
            }
            Some(_) => {
                self.schedule(FlowOp::Detach(kind));
                self.schedule(FlowOp::Attach(kind, source));
            }
            None => self.schedule(FlowOp::Attach(kind, source)),
        }
    }

    pub fn stop(&mut self, kind: MediaKind) {
        if self.active.remove(&kind).is_none() {
            debug!("{} is not running", kind);
            return;
        }
        self.schedule(FlowOp::Detach(kind));
    }

    fn schedule(&self, op: FlowOp) {
        if self.ops.send(op).is_err() {
            warn!("flow worker is gone");
        }
    }

    /// Detaches every active flow and waits for the worker to finish.
    pub async fn shutdown(mut self) {
        let kinds: Vec<_> = self.active.drain().map(|(kind, _)| kind).collect();
        for kind in kinds {
            self.schedule(FlowOp::Detach(kind));
        }
        let Self { ops, worker, .. } = self;
        drop(ops);
        if let Err(err) = worker.await {
            warn!("flow worker failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingFlows {
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFlows for RecordingFlows {
        async fn attach(&self, kind: MediaKind, source: FlowSource) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("attach {} {}", kind, source));
            Ok(())
        }

        async fn detach(&self, kind: MediaKind) -> Result<()> {
            self.ops.lock().unwrap().push(format!("detach {}", kind));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_inactive_flow_is_noop() {
        let flows = Arc::new(RecordingFlows::default());
        let mut controller = FlowController::new(flows.clone());
        controller.stop(MediaKind::Video);
        controller.shutdown().await;
        assert!(flows.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_yields_one_flow() {
        let flows = Arc::new(RecordingFlows::default());
        let mut controller = FlowController::new(flows.clone());
        controller.start(MediaKind::Video, FlowSource::TestPattern);
        controller.start(MediaKind::Video, FlowSource::TestPattern);
        assert_eq!(
            controller.active(MediaKind::Video),
            Some(FlowSource::TestPattern)
        );
        controller.shutdown().await;
        assert_eq!(
            *flows.ops.lock().unwrap(),
            vec!["attach VIDEO TESTPATTERN", "detach VIDEO"]
        );
    }

    #[tokio::test]
    async fn test_other_source_replaces_flow() {
        let flows = Arc::new(RecordingFlows::default());
        let mut controller = FlowController::new(flows.clone());
        controller.start(MediaKind::Video, FlowSource::TestPattern);
        controller.start(MediaKind::Audio, FlowSource::TestPattern);
        controller.start(MediaKind::Video, FlowSource::Loopback);
        controller.stop(MediaKind::Audio);
        assert_eq!(controller.active(MediaKind::Audio), None);
        controller.shutdown().await;
        assert_eq!(
            *flows.ops.lock().unwrap(),
            vec![
                "attach VIDEO TESTPATTERN",
                "attach AUDIO TESTPATTERN",
                "detach VIDEO",
                "attach VIDEO LOOPBACK",
                "detach AUDIO",
                "detach VIDEO",
            ]
        );
    }
}
