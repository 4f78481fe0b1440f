//! Per-attempt negotiation state.
//!
//! The phase carries the peer connection, so steps that need a remote
//! description (applying candidates, accepting an answer) cannot be reached
//! without one.

use std::sync::Arc;

use crate::error::NegotiationError;
use crate::peer::ice::CandidateQueue;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, SessionDescription};

pub enum Phase {
    New,
    /// Caller: offer applied locally and published, waiting for the answer.
    HaveLocalOffer(Arc<dyn PeerTransport>),
    /// Callee: remote offer applied, answer not yet published.
    HaveRemoteOffer(Arc<dyn PeerTransport>),
    Stable(Arc<dyn PeerTransport>),
    Closed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::HaveLocalOffer(_) => "have-local-offer",
            Phase::HaveRemoteOffer(_) => "have-remote-offer",
            Phase::Stable(_) => "stable",
            Phase::Closed => "closed",
        }
    }
}

/// What to do with a candidate received from the peer.
pub enum CandidateAction {
    Apply(Arc<dyn PeerTransport>, IceCandidate),
    Queued,
    Dropped,
}

pub struct Negotiation {
    phase: Phase,
    pending_offer: Option<SessionDescription>,
    candidates: CandidateQueue,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self {
            phase: Phase::New,
            pending_offer: None,
            candidates: CandidateQueue::default(),
        }
    }
}

impl Negotiation {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn phase_name(&self) -> &'static str {
        self.phase.name()
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerTransport>> {
        match &self.phase {
            Phase::HaveLocalOffer(pc) | Phase::HaveRemoteOffer(pc) | Phase::Stable(pc) => {
                Some(pc.clone())
            }
            Phase::New | Phase::Closed => None,
        }
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    fn require_new(&self, action: &'static str) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::New => Ok(()),
            _ => Err(NegotiationError::InvalidTransition {
                action,
                phase: self.phase.name(),
            }),
        }
    }

    /// Checks that an offer may be started from here.
    pub fn can_offer(&self) -> Result<(), NegotiationError> {
        self.require_new("send an offer")
    }

    /// new → have-local-offer
    pub fn offer_sent(&mut self, peer: Arc<dyn PeerTransport>) -> Result<(), NegotiationError> {
        self.require_new("send an offer")?;
        self.phase = Phase::HaveLocalOffer(peer);
        Ok(())
    }

    /// Remembers an incoming offer; a later offer replaces an earlier one and
    /// discards the candidates queued for it.
    pub fn offer_received(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::New => {
                if self
                    .pending_offer
                    .as_ref()
                    .is_some_and(|old| old.sdp != offer.sdp)
                {
                    self.candidates.clear();
                }
                self.pending_offer = Some(offer);
                Ok(())
            }
            _ => Err(NegotiationError::UnexpectedOffer {
                phase: self.phase.name(),
            }),
        }
    }

    pub fn pending_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.require_new("answer")?;
        self.pending_offer
            .clone()
            .ok_or(NegotiationError::NoPendingOffer)
    }

    /// new → have-remote-offer. Returns the candidates queued so far, to be applied now.
    /// The offer stays pending until the answer is out, so a failed answer can be retried.
    pub fn remote_offer_applied(
        &mut self,
        peer: Arc<dyn PeerTransport>,
    ) -> Result<Vec<IceCandidate>, NegotiationError> {
        self.require_new("apply a remote offer")?;
        self.phase = Phase::HaveRemoteOffer(peer);
        Ok(self.candidates.drain())
    }

    /// have-remote-offer → stable
    pub fn answer_sent(&mut self) -> Result<(), NegotiationError> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::HaveRemoteOffer(pc) => {
                self.phase = Phase::Stable(pc);
                self.pending_offer = None;
                Ok(())
            }
            other => {
                let phase = other.name();
                self.phase = other;
                Err(NegotiationError::InvalidTransition {
                    action: "complete an answer",
                    phase,
                })
            }
        }
    }

    /// The peer an incoming answer must be applied to.
    pub fn answer_target(&self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        match &self.phase {
            Phase::HaveLocalOffer(pc) => Ok(pc.clone()),
            other => Err(NegotiationError::UnexpectedAnswer {
                phase: other.name(),
            }),
        }
    }

    /// have-local-offer → stable. Returns the queued candidates to apply now.
    pub fn remote_answer_applied(&mut self) -> Result<Vec<IceCandidate>, NegotiationError> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::HaveLocalOffer(pc) => {
                self.phase = Phase::Stable(pc);
                Ok(self.candidates.drain())
            }
            other => {
                let phase = other.name();
                self.phase = other;
                Err(NegotiationError::UnexpectedAnswer { phase })
            }
        }
    }

    /// Applies once a remote description exists, queues before that.
    pub fn candidate_received(&mut self, candidate: IceCandidate) -> CandidateAction {
        match &self.phase {
            Phase::HaveRemoteOffer(pc) | Phase::Stable(pc) => {
                CandidateAction::Apply(pc.clone(), candidate)
            }
            Phase::New | Phase::HaveLocalOffer(_) => {
                self.candidates.push(candidate);
                CandidateAction::Queued
            }
            Phase::Closed => CandidateAction::Dropped,
        }
    }

    /// Abandons the current attempt and returns to `new`; the caller closes the returned peer.
    pub fn reset(&mut self) -> Option<Arc<dyn PeerTransport>> {
        let peer = self.peer();
        if !matches!(self.phase, Phase::Closed) {
            self.phase = Phase::New;
        }
        self.candidates.clear();
        peer
    }

    /// Terminal; the caller closes the returned peer.
    pub fn close(&mut self) -> Option<Arc<dyn PeerTransport>> {
        let peer = self.peer();
        self.phase = Phase::Closed;
        self.pending_offer = None;
        self.candidates.clear();
        peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackNetwork;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 {n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn peer() -> Arc<dyn PeerTransport> {
        LoopbackNetwork::new().peer()
    }

    #[tokio::test]
    async fn caller_path_queues_candidates_until_answer() {
        let mut n = Negotiation::default();
        n.offer_sent(peer().await).expect("offer");
        assert_eq!(n.phase_name(), "have-local-offer");

        assert!(matches!(n.candidate_received(candidate(1)), CandidateAction::Queued));
        assert!(matches!(n.candidate_received(candidate(2)), CandidateAction::Queued));
        n.answer_target().expect("target");

        let flushed = n.remote_answer_applied().expect("stable");
        assert_eq!(flushed, vec![candidate(1), candidate(2)]);
        assert_eq!(n.phase_name(), "stable");
        assert!(matches!(n.candidate_received(candidate(3)), CandidateAction::Apply(..)));
    }

    #[tokio::test]
    async fn callee_path_keeps_latest_offer() {
        let mut n = Negotiation::default();
        assert!(matches!(n.pending_offer(), Err(NegotiationError::NoPendingOffer)));
        n.offer_received(SessionDescription::offer("first")).expect("offer");
        n.offer_received(SessionDescription::offer("second")).expect("offer");
        assert_eq!(n.pending_offer().expect("offer").sdp, "second");

        n.candidate_received(candidate(1));
        let flushed = n.remote_offer_applied(peer().await).expect("remote offer");
        assert_eq!(flushed.len(), 1);
        assert!(n.has_pending_offer());
        n.answer_sent().expect("stable");
        assert_eq!(n.phase_name(), "stable");
        assert!(!n.has_pending_offer());
    }

    #[tokio::test]
    async fn newer_offer_discards_candidates_of_the_old_one() {
        let mut n = Negotiation::default();
        n.offer_received(SessionDescription::offer("first")).expect("offer");
        n.candidate_received(candidate(1));
        n.candidate_received(candidate(2));
        n.offer_received(SessionDescription::offer("first")).expect("same offer again");
        assert_eq!(n.queued_candidates(), 2);

        n.offer_received(SessionDescription::offer("second")).expect("offer");
        assert_eq!(n.queued_candidates(), 0);
        n.candidate_received(candidate(3));
        let flushed = n.remote_offer_applied(peer().await).expect("remote offer");
        assert_eq!(flushed, vec![candidate(3)]);
    }

    #[tokio::test]
    async fn answer_before_offer_is_rejected() {
        let mut n = Negotiation::default();
        assert!(matches!(
            n.answer_target(),
            Err(NegotiationError::UnexpectedAnswer { phase: "new" })
        ));
        assert!(n.remote_answer_applied().is_err());
        assert_eq!(n.phase_name(), "new");
        assert!(n.answer_sent().is_err());
        assert_eq!(n.phase_name(), "new");
    }

    #[tokio::test]
    async fn offers_rejected_mid_negotiation() {
        let mut n = Negotiation::default();
        n.offer_sent(peer().await).expect("offer");
        assert!(matches!(
            n.offer_received(SessionDescription::offer("glare")),
            Err(NegotiationError::UnexpectedOffer { .. })
        ));
        assert!(n.offer_sent(peer().await).is_err());
    }

    #[tokio::test]
    async fn failed_answer_keeps_offer_for_retry() {
        let mut n = Negotiation::default();
        n.offer_received(SessionDescription::offer("v=0")).expect("offer");
        n.remote_offer_applied(peer().await).expect("remote offer");
        assert!(n.reset().is_some());
        assert_eq!(n.pending_offer().expect("still pending").sdp, "v=0");
    }

    #[tokio::test]
    async fn reset_returns_to_new_and_close_is_terminal() {
        let mut n = Negotiation::default();
        n.offer_sent(peer().await).expect("offer");
        n.candidate_received(candidate(1));
        assert!(n.reset().is_some());
        assert_eq!(n.phase_name(), "new");
        assert_eq!(n.queued_candidates(), 0);

        n.offer_sent(peer().await).expect("offer again");
        assert!(n.close().is_some());
        assert!(matches!(n.candidate_received(candidate(2)), CandidateAction::Dropped));
        assert!(n.reset().is_none());
        assert_eq!(n.phase_name(), "closed");
    }
}
