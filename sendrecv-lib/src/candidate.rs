use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{connection::MediaEngine, signaling::IceCandidate};

/// Holds remote candidates until a remote description exists.
#[derive(Debug, Default)]
pub struct CandidateRelay {
    pending: VecDeque<IceCandidate>,
    remote_description_applied: bool,
}

impl CandidateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies the candidate now or queues it for later.
    pub async fn on_remote_candidate<E: MediaEngine + ?Sized>(
        &mut self,
        engine: &E,
        candidate: IceCandidate,
    ) {
        if !self.remote_description_applied {
            debug!("queue candidate {}", candidate.candidate);
            self.pending.push_back(candidate);
            return;
        }
        apply(engine, candidate).await;
    }

    /// Flushes the queue in receipt order. A failing candidate is reported
    /// and dropped without stopping the flush.
    pub async fn on_remote_description_applied<E: MediaEngine + ?Sized>(&mut self, engine: &E) {
        self.remote_description_applied = true;
        while let Some(candidate) = self.pending.pop_front() {
            apply(engine, candidate).await;
        }
    }

    pub fn discard(&mut self) {
        if !self.pending.is_empty() {
            debug!("discard {} pending candidates", self.pending.len());
        }
        self.pending.clear();
        self.remote_description_applied = false;
    }
}

async fn apply<E: MediaEngine + ?Sized>(engine: &E, candidate: IceCandidate) {
    let text = candidate.candidate.clone();
    if let Err(err) = engine.add_ice_candidate(candidate).await {
        warn!("Failed to add candidate {}: {:#}", text, err);
    }
}
