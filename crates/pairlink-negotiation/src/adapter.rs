use std::sync::Arc;

use pairlink_core::IceCandidate;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::sdp::filter_codecs;
use crate::NegotiationError;

// MARK: - PendingCandidates

/// Remote hints that arrived before the negotiation session existed.
#[derive(Debug, Default)]
struct PendingCandidates {
    /// Bumped by every reset; an offer applied under an older generation
    /// must not mark the new pass ready.
    generation: u64,
    session_ready: bool,
    queued: Vec<IceCandidate>,
}

// MARK: - NegotiationAdapter

/// Sits between the signaling channel and the [`MediaEngine`].
///
/// Offers are codec-filtered before the engine sees them. Remote hints are
/// queued until the first offer has created the session, then replayed in
/// arrival order; after that they go straight through. The queue and the
/// ready flag share one lock, so a hint can never slip between the drain and
/// the flag flip.
pub struct NegotiationAdapter {
    engine: Arc<dyn MediaEngine>,
    filtered_codecs: Vec<String>,
    pending: Mutex<PendingCandidates>,
}

impl NegotiationAdapter {
    pub fn new(engine: Arc<dyn MediaEngine>, filtered_codecs: Vec<String>) -> Self {
        Self {
            engine,
            filtered_codecs,
            pending: Mutex::new(PendingCandidates::default()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Apply a remote offer and return the local answer.
    pub async fn apply_offer(&self, offer: &str) -> Result<String, NegotiationError> {
        let generation = self.pending.lock().generation;
        let filtered = filter_codecs(offer, &self.filtered_codecs);
        if filtered.len() != offer.len() {
            debug!("[Negotiation] Filtered {:?} from offer", self.filtered_codecs);
        }

        self.engine
            .apply_remote_offer(&filtered)
            .await
            .map_err(|e| NegotiationError::OfferRejected(e.to_string()))?;

        self.flush_pending(generation)?;

        let answer = self
            .engine
            .create_answer()
            .await
            .map_err(|e| NegotiationError::AnswerFailed(e.to_string()))?;
        info!("[Negotiation] Answer ready ({} bytes)", answer.len());
        Ok(answer)
    }

    /// Forward a remote hint, or queue it until the session exists.
    pub fn add_remote_candidate(&self, candidate: IceCandidate) {
        let mut pending = self.pending.lock();
        if pending.session_ready {
            self.forward(&candidate);
        } else {
            debug!("[Negotiation] Queued ICE candidate (mid={})", candidate.sdp_mid);
            pending.queued.push(candidate);
        }
    }

    /// Forget the session and any queued hints. Used when the lifecycle
    /// restarts and the next offer will create a new session.
    pub fn reset(&self) {
        let mut pending = self.pending.lock();
        if !pending.queued.is_empty() {
            debug!("[Negotiation] Dropping {} queued ICE candidates", pending.queued.len());
        }
        *pending = PendingCandidates {
            generation: pending.generation.wrapping_add(1),
            ..PendingCandidates::default()
        };
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().queued.len()
    }

    #[cfg(test)]
    fn session_ready(&self) -> bool {
        self.pending.lock().session_ready
    }

    fn flush_pending(&self, generation: u64) -> Result<(), NegotiationError> {
        let mut pending = self.pending.lock();
        if pending.generation != generation {
            debug!("[Negotiation] Offer outlived a reset; not marking the session ready");
            return Err(NegotiationError::Superseded);
        }
        if pending.session_ready {
            return Ok(());
        }
        pending.session_ready = true;
        let queued = std::mem::take(&mut pending.queued);
        if !queued.is_empty() {
            info!("[Negotiation] Replaying {} queued ICE candidates", queued.len());
        }
        for candidate in &queued {
            self.forward(candidate);
        }
        Ok(())
    }

    fn forward(&self, candidate: &IceCandidate) {
        if let Err(e) = self.engine.add_ice_candidate(candidate) {
            warn!("[Negotiation] ICE candidate rejected: {}", e);
        }
    }
}
