//! Lifecycle of one call between this user and a peer, driven by typed
//! events: local commands and signals from the peer.

use std::sync::Arc;

use crate::client::error::ClientError;
use crate::client::relay::NegotiationRelay;
use crate::client::retry::{retry, RetryPolicy};
use crate::client::transport::SignalingTransport;
use crate::signal::{CallKind, Signal, SignalKind, SignalPayload, UserStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing { direction: Direction },
    Negotiating,
    Connected,
}

/// What a handled signal did to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// The callee accepted; negotiation starts.
    Accepted,
    /// The callee declined.
    Rejected,
    /// The caller withdrew the invitation before it was answered.
    Withdrawn,
    /// The peer hung up.
    Ended,
}

/// Result of one [`CallCoordinator::poll`].
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub transition: Option<CallTransition>,
    /// Every fetched signal that did not cause the transition. The fetch
    /// consumed them, so they are the caller's to dispatch.
    pub unhandled: Vec<Signal>,
}

pub struct CallCoordinator {
    transport: Arc<dyn SignalingTransport>,
    relay: NegotiationRelay,
    peer: String,
    call_kind: CallKind,
    state: CallState,
    /// Id of the invitation that opened this call.
    call_id: Option<i64>,
    policy: RetryPolicy,
}

impl CallCoordinator {
    /// A call this user is about to place.
    pub fn new(transport: Arc<dyn SignalingTransport>, peer: impl Into<String>, call_kind: CallKind) -> Self {
        let peer = peer.into();
        Self {
            relay: NegotiationRelay::new(transport.clone(), peer.clone(), call_kind),
            transport,
            peer,
            call_kind,
            state: CallState::Idle,
            call_id: None,
            policy: RetryPolicy::default(),
        }
    }

    /// A call offered to this user by a fetched `call-request`.
    pub fn from_invitation(transport: Arc<dyn SignalingTransport>, invitation: &Signal) -> Result<Self, ClientError> {
        if invitation.kind != SignalKind::CallRequest {
            return Err(ClientError::InvalidState(format!(
                "{} is not an invitation",
                invitation.kind
            )));
        }

        let call_kind = match invitation.decode_payload() {
            Ok(SignalPayload::Invitation { call_kind }) => call_kind,
            _ => invitation.call_kind,
        };

        let mut coordinator = Self::new(transport, invitation.from_user.clone(), call_kind);
        coordinator.state = CallState::Ringing {
            direction: Direction::Incoming,
        };
        coordinator.call_id = Some(invitation.id);
        Ok(coordinator)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.relay = self.relay.with_policy(policy);
        self.policy = policy;
        self
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn call_kind(&self) -> CallKind {
        self.call_kind
    }

    /// Id of the `call-request` this call started from, once there is one.
    pub fn call_id(&self) -> Option<i64> {
        self.call_id
    }

    pub fn relay(&self) -> &NegotiationRelay {
        &self.relay
    }

    pub(crate) fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    fn expect(&self, expected: CallState, action: &str) -> Result<(), ClientError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ClientError::InvalidState(format!("cannot {} while {:?}", action, self.state)))
        }
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ClientError> {
        retry(&self.policy, "set status", || self.transport.set_status(status)).await
    }

    async fn delete(&self, kind: SignalKind) -> Result<u64, ClientError> {
        retry(&self.policy, "delete signals", || {
            self.transport.delete_signals(&self.peer, Some(kind))
        })
        .await
    }

    /// Idle → Ringing(outgoing). Fails with `Busy` if the callee is on a call.
    /// A `call-ended` still queued from an earlier call with the peer is
    /// dropped first.
    pub async fn invite(&mut self) -> Result<i64, ClientError> {
        self.expect(CallState::Idle, "invite")?;

        match self.delete(SignalKind::CallEnded).await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(peer = %self.peer, purged, "purged stale call-ended"),
            Err(e) => tracing::warn!(peer = %self.peer, "failed to purge stale call-ended: {}", e),
        }

        let id = retry(&self.policy, "invite", || {
            self.transport.send_call_request(&self.peer, self.call_kind)
        })
        .await?;

        self.state = CallState::Ringing {
            direction: Direction::Outgoing,
        };
        self.call_id = Some(id);
        tracing::info!(peer = %self.peer, call_kind = %self.call_kind, signal_id = id, "ringing");

        if let Err(e) = self.set_status(UserStatus::OnCall).await {
            tracing::warn!("failed to mark caller on_call: {}", e);
        }
        Ok(id)
    }

    /// Ringing(incoming) → Negotiating. The invitation is claimed by
    /// deleting it; if it is already gone the call was withdrawn.
    pub async fn accept(&mut self) -> Result<(), ClientError> {
        self.expect(
            CallState::Ringing {
                direction: Direction::Incoming,
            },
            "accept",
        )?;

        if self.delete(SignalKind::CallRequest).await? == 0 {
            self.state = CallState::Idle;
            return Err(ClientError::InvalidState(
                "invitation is no longer pending".to_string(),
            ));
        }

        self.relay
            .send(SignalKind::CallAccepted, SignalPayload::Decision { accepted: true })
            .await?;
        self.set_status(UserStatus::OnCall).await?;

        self.state = CallState::Negotiating;
        tracing::info!(peer = %self.peer, "call accepted");
        Ok(())
    }

    /// Ringing(incoming) → Idle.
    pub async fn reject(&mut self) -> Result<(), ClientError> {
        self.expect(
            CallState::Ringing {
                direction: Direction::Incoming,
            },
            "reject",
        )?;

        self.relay
            .send(SignalKind::CallRejected, SignalPayload::Decision { accepted: false })
            .await?;
        self.delete(SignalKind::CallRequest).await?;

        self.state = CallState::Idle;
        tracing::info!(peer = %self.peer, "call rejected");
        Ok(())
    }

    /// Ringing(outgoing) → Idle. The callee learns through `call-ended`.
    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        self.expect(
            CallState::Ringing {
                direction: Direction::Outgoing,
            },
            "cancel",
        )?;

        self.relay.send(SignalKind::CallEnded, SignalPayload::Ended).await?;
        // An accept may have raced the cancel.
        self.delete(SignalKind::CallAccepted).await?;
        self.set_status(UserStatus::Online).await?;

        self.state = CallState::Idle;
        tracing::info!(peer = %self.peer, "invitation cancelled");
        Ok(())
    }

    /// Negotiating/Connected → Idle on a local hangup.
    pub async fn hang_up(&mut self) -> Result<(), ClientError> {
        if !matches!(self.state, CallState::Negotiating | CallState::Connected) {
            return Err(ClientError::InvalidState(format!(
                "cannot hang up while {:?}",
                self.state
            )));
        }

        self.relay.send(SignalKind::CallEnded, SignalPayload::Ended).await?;
        self.set_status(UserStatus::Online).await?;

        self.state = CallState::Idle;
        tracing::info!(peer = %self.peer, "hung up");
        Ok(())
    }

    /// Negotiating → Connected, once the peer connection reports it.
    pub fn mark_connected(&mut self) -> Result<(), ClientError> {
        match self.state {
            CallState::Negotiating => {
                self.state = CallState::Connected;
                Ok(())
            }
            CallState::Connected => Ok(()),
            other => Err(ClientError::InvalidState(format!(
                "cannot connect while {:?}",
                other
            ))),
        }
    }

    /// Best-effort teardown for failure paths: tells the peer the call is
    /// over and reverts presence to online. Never fails.
    pub async fn finish(&mut self) {
        let notify = match self.state {
            CallState::Idle => false,
            CallState::Ringing {
                direction: Direction::Incoming,
            } => {
                if let Err(e) = self
                    .relay
                    .send(SignalKind::CallRejected, SignalPayload::Decision { accepted: false })
                    .await
                {
                    tracing::warn!(peer = %self.peer, "failed to decline invitation: {}", e);
                }
                if let Err(e) = self.delete(SignalKind::CallRequest).await {
                    tracing::warn!(peer = %self.peer, "failed to drop invitation: {}", e);
                }
                false
            }
            _ => true,
        };

        if notify {
            if let Err(e) = self.relay.send(SignalKind::CallEnded, SignalPayload::Ended).await {
                tracing::warn!(peer = %self.peer, "failed to notify peer of call end: {}", e);
            }
        }

        if self.state != CallState::Idle {
            if let Err(e) = self.set_status(UserStatus::Online).await {
                tracing::warn!("failed to restore online status: {}", e);
            }
        }

        self.state = CallState::Idle;
    }

    /// Applies a lifecycle signal from the peer. Signals from other users,
    /// negotiation kinds, hangups older than this call's invitation and
    /// signals that do not fit the current state are ignored and return
    /// `None`.
    pub async fn handle(&mut self, signal: &Signal) -> Result<Option<CallTransition>, ClientError> {
        if signal.from_user != self.peer {
            return Ok(None);
        }
        if signal.kind == SignalKind::CallEnded && matches!(self.call_id, Some(id) if signal.id < id) {
            tracing::debug!(peer = %self.peer, signal_id = signal.id, "ignoring call-ended from an earlier call");
            return Ok(None);
        }

        let outgoing = CallState::Ringing {
            direction: Direction::Outgoing,
        };
        let incoming = CallState::Ringing {
            direction: Direction::Incoming,
        };

        let transition = match (signal.kind, self.state) {
            (SignalKind::CallAccepted, state) if state == outgoing => {
                // A zero count means another poll already claimed it.
                if self.delete(SignalKind::CallAccepted).await? == 0 {
                    return Ok(None);
                }
                self.set_status(UserStatus::OnCall).await?;
                self.state = CallState::Negotiating;
                CallTransition::Accepted
            }
            (SignalKind::CallRejected, state) if state == outgoing => {
                self.delete(SignalKind::CallRejected).await?;
                self.set_status(UserStatus::Online).await?;
                self.state = CallState::Idle;
                CallTransition::Rejected
            }
            (SignalKind::CallEnded, state) if state == incoming => {
                self.delete(SignalKind::CallRequest).await?;
                self.delete(SignalKind::CallEnded).await?;
                self.state = CallState::Idle;
                CallTransition::Withdrawn
            }
            (SignalKind::CallEnded, CallState::Idle) => return Ok(None),
            (SignalKind::CallEnded, _) => {
                self.delete(SignalKind::CallEnded).await?;
                self.set_status(UserStatus::Online).await?;
                self.state = CallState::Idle;
                CallTransition::Ended
            }
            _ => return Ok(None),
        };

        tracing::info!(peer = %self.peer, ?transition, "call transition");
        Ok(Some(transition))
    }

    /// Fetches the inbox and applies the first lifecycle signal from the
    /// peer, `call-ended` ahead of anything else in the batch. The rest of
    /// the batch comes back in [`PollOutcome::unhandled`], in fetch order.
    pub async fn poll(&mut self) -> Result<PollOutcome, ClientError> {
        let mut batch = self.transport.fetch_signals().await?;
        prioritize_hangups(&mut batch);

        let mut outcome = PollOutcome::default();
        for signal in batch {
            if outcome.transition.is_none() {
                if let Some(transition) = self.handle(&signal).await? {
                    outcome.transition = Some(transition);
                    continue;
                }
            }
            outcome.unhandled.push(signal);
        }
        Ok(outcome)
    }
}

/// Moves `call-ended` signals to the front, keeping insertion order
/// otherwise.
pub fn prioritize_hangups(batch: &mut [Signal]) {
    batch.sort_by_key(|signal| signal.kind != SignalKind::CallEnded);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::LocalTransport;
    use crate::config::Config;
    use crate::db::{memory_pool, UserRepository};
    use crate::service::SignalingService;

    struct Pair {
        service: SignalingService,
        alice: String,
        bob: String,
    }

    impl Pair {
        async fn new() -> Self {
            let pool = memory_pool().await;
            let alice = UserRepository::create(&pool, "alice", None).await.unwrap().id;
            let bob = UserRepository::create(&pool, "bob", None).await.unwrap().id;
            let service = SignalingService::new(pool, Arc::new(Config::default()));
            service.set_status(&alice, UserStatus::Online).await.unwrap();
            service.set_status(&bob, UserStatus::Online).await.unwrap();
            Self { service, alice, bob }
        }

        fn transport(&self, user: &str) -> Arc<dyn SignalingTransport> {
            Arc::new(LocalTransport::new(self.service.clone(), user))
        }

        async fn status(&self, user: &str) -> UserStatus {
            UserRepository::get_by_id(self.service.pool(), user)
                .await
                .unwrap()
                .unwrap()
                .status()
                .unwrap()
        }

        async fn invitation_for_bob(&self) -> CallCoordinator {
            let inbox = self.service.fetch_signals(&self.bob).await.unwrap();
            let invitation = inbox
                .iter()
                .find(|s| s.kind == SignalKind::CallRequest)
                .expect("invitation delivered");
            CallCoordinator::from_invitation(self.transport(&self.bob), invitation).unwrap()
        }
    }

    #[tokio::test]
    async fn rejected_call_returns_both_sides_to_idle() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        caller.invite().await.unwrap();
        assert_eq!(caller.state(), CallState::Ringing { direction: Direction::Outgoing });
        assert_eq!(pair.status(&pair.alice).await, UserStatus::OnCall);

        let mut callee = pair.invitation_for_bob().await;
        assert_eq!(callee.call_kind(), CallKind::Video);
        callee.reject().await.unwrap();
        assert_eq!(callee.state(), CallState::Idle);

        assert_eq!(caller.poll().await.unwrap().transition, Some(CallTransition::Rejected));
        assert_eq!(caller.state(), CallState::Idle);
        assert_eq!(pair.status(&pair.alice).await, UserStatus::Online);

        assert!(pair.service.fetch_signals(&pair.alice).await.unwrap().is_empty());
        assert!(pair.service.fetch_signals(&pair.bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_call_moves_both_sides_to_negotiating() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Audio);
        caller.invite().await.unwrap();

        let mut callee = pair.invitation_for_bob().await;
        callee.accept().await.unwrap();
        assert_eq!(callee.state(), CallState::Negotiating);
        assert_eq!(pair.status(&pair.bob).await, UserStatus::OnCall);

        assert_eq!(caller.poll().await.unwrap().transition, Some(CallTransition::Accepted));
        assert_eq!(caller.state(), CallState::Negotiating);

        // The accept was claimed, so it is not delivered again.
        assert_eq!(caller.poll().await.unwrap().transition, None);

        caller.mark_connected().unwrap();
        caller.hang_up().await.unwrap();
        assert_eq!(pair.status(&pair.alice).await, UserStatus::Online);

        assert_eq!(callee.poll().await.unwrap().transition, Some(CallTransition::Ended));
        assert_eq!(callee.state(), CallState::Idle);
        assert_eq!(pair.status(&pair.bob).await, UserStatus::Online);
    }

    #[tokio::test]
    async fn withdrawn_invitation_cannot_be_accepted() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        caller.invite().await.unwrap();
        let mut late_callee = pair.invitation_for_bob().await;
        let mut callee = pair.invitation_for_bob().await;

        caller.cancel().await.unwrap();
        assert_eq!(pair.status(&pair.alice).await, UserStatus::Online);

        assert_eq!(callee.poll().await.unwrap().transition, Some(CallTransition::Withdrawn));
        assert!(pair.service.fetch_signals(&pair.bob).await.unwrap().is_empty());

        let err = late_callee.accept().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn poll_hands_back_signals_it_did_not_apply() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        caller.invite().await.unwrap();

        let mut callee = pair.invitation_for_bob().await;
        callee.accept().await.unwrap();
        callee.relay().send_ready().await.unwrap();

        let outcome = caller.poll().await.unwrap();
        assert_eq!(outcome.transition, Some(CallTransition::Accepted));
        let kinds: Vec<_> = outcome.unhandled.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::ReceiverReady]);

        let outcome = caller.poll().await.unwrap();
        assert_eq!(outcome.transition, None);
        assert!(outcome.unhandled.is_empty());
    }

    #[tokio::test]
    async fn hangups_older_than_the_invitation_are_ignored() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        let call_id = caller.invite().await.unwrap();

        let mut callee = pair.invitation_for_bob().await;
        assert_eq!(callee.call_id(), Some(call_id));

        let leftover = Signal {
            id: call_id - 1,
            from_user: pair.alice.clone(),
            from_username: "alice".into(),
            from_avatar_ref: None,
            kind: SignalKind::CallEnded,
            payload: serde_json::json!({ "ended": true }),
            call_kind: CallKind::Video,
        };
        assert_eq!(callee.handle(&leftover).await.unwrap(), None);
        assert_eq!(callee.state(), CallState::Ringing { direction: Direction::Incoming });

        // A withdrawal sent after the accept still ends the call.
        callee.accept().await.unwrap();
        caller.relay().send(SignalKind::CallEnded, SignalPayload::Ended).await.unwrap();
        assert_eq!(callee.poll().await.unwrap().transition, Some(CallTransition::Ended));
        assert_eq!(pair.status(&pair.bob).await, UserStatus::Online);
    }

    #[tokio::test]
    async fn inviting_purges_a_leftover_hangup() {
        let pair = Pair::new().await;
        let bob_side = pair.transport(&pair.bob);
        NegotiationRelay::new(bob_side, &pair.alice, CallKind::Video)
            .send(SignalKind::CallEnded, SignalPayload::Ended)
            .await
            .unwrap();

        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        caller.invite().await.unwrap();
        assert!(pair.service.fetch_signals(&pair.alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inviting_a_busy_user_stays_idle() {
        let pair = Pair::new().await;
        pair.service.set_status(&pair.bob, UserStatus::OnCall).await.unwrap();

        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        assert!(matches!(caller.invite().await, Err(ClientError::Busy)));
        assert_eq!(caller.state(), CallState::Idle);
        assert_eq!(pair.status(&pair.alice).await, UserStatus::Online);
    }

    #[tokio::test]
    async fn commands_out_of_state_are_refused() {
        let pair = Pair::new().await;
        let mut caller = CallCoordinator::new(pair.transport(&pair.alice), &pair.bob, CallKind::Video);
        assert!(matches!(caller.accept().await, Err(ClientError::InvalidState(_))));
        assert!(matches!(caller.hang_up().await, Err(ClientError::InvalidState(_))));
        assert!(caller.mark_connected().is_err());
    }

    #[test]
    fn hangups_jump_the_queue() {
        let signal = |id, kind| Signal {
            id,
            from_user: "peer".into(),
            from_username: "peer".into(),
            from_avatar_ref: None,
            kind,
            payload: serde_json::json!({ "ended": true }),
            call_kind: CallKind::Video,
        };
        let mut batch = vec![
            signal(1, SignalKind::Offer),
            signal(2, SignalKind::IceCandidate),
            signal(3, SignalKind::CallEnded),
            signal(4, SignalKind::VideoStatus),
        ];
        prioritize_hangups(&mut batch);
        assert_eq!(batch.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 1, 2, 4]);
    }
}
