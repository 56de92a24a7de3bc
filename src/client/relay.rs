use std::sync::Arc;

use crate::client::error::ClientError;
use crate::client::retry::{retry, RetryPolicy};
use crate::client::transport::SignalingTransport;
use crate::signal::{CallKind, IceCandidate, MediaToggle, OutgoingSignal, SessionDescription, SignalKind, SignalPayload};

/// Typed sends to the other participant of one call. Every signal carries
/// the call's media kind.
#[derive(Clone)]
pub struct NegotiationRelay {
    transport: Arc<dyn SignalingTransport>,
    peer: String,
    call_kind: CallKind,
    policy: RetryPolicy,
}

impl NegotiationRelay {
    pub fn new(transport: Arc<dyn SignalingTransport>, peer: impl Into<String>, call_kind: CallKind) -> Self {
        Self {
            transport,
            peer: peer.into(),
            call_kind,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send_offer(&self, offer: &SessionDescription) -> Result<i64, ClientError> {
        self.send(SignalKind::Offer, SignalPayload::Description(offer.clone())).await
    }

    pub async fn send_answer(&self, answer: &SessionDescription) -> Result<i64, ClientError> {
        self.send(SignalKind::Answer, SignalPayload::Description(answer.clone())).await
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<i64, ClientError> {
        self.send(SignalKind::IceCandidate, SignalPayload::Candidate(candidate.clone())).await
    }

    pub async fn send_video_status(&self, enabled: bool) -> Result<i64, ClientError> {
        self.send(SignalKind::VideoStatus, toggle(enabled)).await
    }

    pub async fn send_audio_status(&self, enabled: bool) -> Result<i64, ClientError> {
        self.send(SignalKind::AudioStatus, toggle(enabled)).await
    }

    pub async fn send_ready(&self) -> Result<i64, ClientError> {
        self.send(SignalKind::ReceiverReady, SignalPayload::Ready).await
    }

    pub(crate) async fn send(&self, kind: SignalKind, payload: SignalPayload) -> Result<i64, ClientError> {
        let signal = OutgoingSignal::new(self.peer.as_str(), kind, &payload, self.call_kind);
        let id = retry(&self.policy, kind.as_str(), || self.transport.send_signal(&signal)).await?;
        tracing::trace!(signal_id = id, peer = %self.peer, %kind, "relayed");
        Ok(id)
    }
}

fn toggle(enabled: bool) -> SignalPayload {
    SignalPayload::MediaToggle(MediaToggle { enabled, reason: None })
}
