//! Background presence for a signed-in client: heartbeat, peer list refresh
//! and incoming call detection, each on its own cadence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::transport::{SignalingTransport, FETCH_TIMEOUT};
use crate::signal::{PresenceEntry, Signal, SignalKind, UserStatus};

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub heartbeat_interval: Duration,
    pub refresh_interval: Duration,
    pub incoming_check_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(2),
            incoming_check_interval: Duration::from_secs(1),
            fetch_timeout: FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Fresh listing of everyone else.
    Peers(Vec<PresenceEntry>),
    /// A new invitation. Reported once even though it stays in the inbox.
    IncomingCall(Signal),
    /// The caller of a reported invitation hung up before it was answered.
    /// Feed it to the invitation's coordinator.
    InvitationWithdrawn(Signal),
}

pub struct PumpHandle {
    in_call: watch::Sender<bool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PumpHandle {
    /// While in a call the heartbeat reports on_call and the incoming check
    /// pauses, leaving the inbox to the call engine.
    pub fn set_in_call(&self, in_call: bool) {
        self.in_call.send_replace(in_call);
    }

    /// Stops all loops and reports the user offline.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("presence pump task failed: {}", e);
        }
    }
}

pub struct PresencePump {
    transport: Arc<dyn SignalingTransport>,
    config: PumpConfig,
}

impl PresencePump {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            config: PumpConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PumpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> (PumpHandle, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (in_call_tx, in_call_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(self.run(in_call_rx, events_tx, cancel.clone()));
        let handle = PumpHandle {
            in_call: in_call_tx,
            cancel,
            task,
        };
        (handle, events_rx)
    }

    async fn run(
        self,
        in_call: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<PresenceEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!("presence pump started");

        tokio::join!(
            self.heartbeat(&in_call, &cancel),
            self.refresh(&events, &cancel),
            self.watch_incoming(&in_call, &events, &cancel),
        );

        if let Err(e) = self.transport.set_status(UserStatus::Offline).await {
            tracing::warn!("failed to report offline on shutdown: {}", e);
        }
        tracing::info!("presence pump stopped");
    }

    async fn heartbeat(&self, in_call: &watch::Receiver<bool>, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let status = if *in_call.borrow() { UserStatus::OnCall } else { UserStatus::Online };
                    if let Err(e) = self.transport.set_status(status).await {
                        tracing::warn!(%status, "heartbeat failed: {}", e);
                    }
                }
            }
        }
    }

    async fn refresh(&self, events: &mpsc::UnboundedSender<PresenceEvent>, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.config.fetch_timeout, self.transport.list_users()).await {
                        Ok(Ok(peers)) => {
                            let _ = events.send(PresenceEvent::Peers(peers));
                        }
                        Ok(Err(e)) => tracing::warn!("peer list refresh failed: {}", e),
                        Err(_) => tracing::warn!("peer list refresh timed out"),
                    }
                }
            }
        }
    }

    async fn watch_incoming(
        &self,
        in_call: &watch::Receiver<bool>,
        events: &mpsc::UnboundedSender<PresenceEvent>,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.incoming_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported: HashSet<i64> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if *in_call.borrow() {
                        continue;
                    }
                    match tokio::time::timeout(self.config.fetch_timeout, self.transport.fetch_signals()).await {
                        Ok(Ok(batch)) => {
                            for event in screen_incoming(&mut reported, batch) {
                                let _ = events.send(event);
                            }
                        }
                        Ok(Err(e)) => tracing::warn!("incoming call check failed: {}", e),
                        Err(_) => tracing::warn!("incoming call check timed out"),
                    }
                }
            }
        }
    }
}

/// Turns one fetched batch into events. `reported` holds invitation ids
/// already surfaced; ids no longer in the inbox are forgotten.
fn screen_incoming(reported: &mut HashSet<i64>, batch: Vec<Signal>) -> Vec<PresenceEvent> {
    let mut out = Vec::new();
    let mut still_pending = HashSet::new();
    let mut callers = HashMap::new();

    for signal in &batch {
        if signal.kind == SignalKind::CallRequest {
            still_pending.insert(signal.id);
            callers.insert(signal.from_user.clone(), signal.id);
        }
    }

    for signal in batch {
        match signal.kind {
            SignalKind::CallRequest if !reported.contains(&signal.id) => {
                tracing::info!(from = %signal.from_username, call_kind = %signal.call_kind, "incoming call");
                out.push(PresenceEvent::IncomingCall(signal));
            }
            SignalKind::CallEnded if matches!(callers.get(&signal.from_user), Some(&invited) if signal.id > invited) => {
                out.push(PresenceEvent::InvitationWithdrawn(signal));
            }
            _ => {}
        }
    }

    *reported = still_pending;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::MemoryMailbox;
    use crate::signal::{CallKind, SignalPayload};

    async fn next(events: &mut mpsc::UnboundedReceiver<PresenceEvent>, want: fn(&PresenceEvent) -> bool) -> PresenceEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.expect("pump stopped");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived")
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_and_listing_run_until_shutdown() {
        let mailbox = MemoryMailbox::with_users(&["alice", "bob", "carol"]);
        mailbox.set_status("alice", UserStatus::Offline);
        mailbox.set_status("carol", UserStatus::OnCall);

        let (handle, mut events) = PresencePump::new(mailbox.transport_for("alice")).spawn(CancellationToken::new());

        let PresenceEvent::Peers(peers) = next(&mut events, |e| matches!(e, PresenceEvent::Peers(_))).await else {
            unreachable!()
        };
        let names: Vec<_> = peers.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol"]);
        assert_eq!(mailbox.status_of("alice"), UserStatus::Online);

        handle.shutdown().await;
        assert_eq!(mailbox.status_of("alice"), UserStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn sticky_invitation_is_reported_once() {
        let mailbox = MemoryMailbox::with_users(&["alice", "bob"]);
        let (handle, mut events) = PresencePump::new(mailbox.transport_for("bob")).spawn(CancellationToken::new());

        mailbox.post("alice", "bob", SignalKind::CallRequest, SignalPayload::Invitation { call_kind: CallKind::Audio });
        let PresenceEvent::IncomingCall(invitation) =
            next(&mut events, |e| matches!(e, PresenceEvent::IncomingCall(_))).await
        else {
            unreachable!()
        };
        assert_eq!(invitation.from_user, "alice");

        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PresenceEvent::IncomingCall(_)), "reported twice");
        }
        assert_eq!(mailbox.pending_for("bob").len(), 1);

        mailbox.post("alice", "bob", SignalKind::CallEnded, SignalPayload::Ended);
        let withdrawn = next(&mut events, |e| matches!(e, PresenceEvent::InvitationWithdrawn(_))).await;
        assert!(matches!(withdrawn, PresenceEvent::InvitationWithdrawn(s) if s.kind == SignalKind::CallEnded));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn in_call_pauses_incoming_checks_and_reports_on_call() {
        let mailbox = MemoryMailbox::with_users(&["alice", "bob"]);
        let (handle, mut events) = PresencePump::new(mailbox.transport_for("bob")).spawn(CancellationToken::new());
        handle.set_in_call(true);

        mailbox.post("alice", "bob", SignalKind::Offer, SignalPayload::Ended);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(mailbox.status_of("bob"), UserStatus::OnCall);
        assert_eq!(mailbox.pending_for("bob").len(), 1, "the call engine owns the inbox");
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, PresenceEvent::Peers(_)));
        }

        handle.shutdown().await;
    }

    #[test]
    fn forgotten_invitations_can_be_reported_again() {
        let invitation = |id| Signal {
            id,
            from_user: "alice".into(),
            from_username: "alice".into(),
            from_avatar_ref: None,
            kind: SignalKind::CallRequest,
            payload: serde_json::json!({ "call_kind": "video" }),
            call_kind: CallKind::Video,
        };

        let mut reported = HashSet::new();
        assert_eq!(screen_incoming(&mut reported, vec![invitation(1)]).len(), 1);
        assert!(screen_incoming(&mut reported, vec![invitation(1)]).is_empty());
        assert!(screen_incoming(&mut reported, vec![]).is_empty());
        assert_eq!(screen_incoming(&mut reported, vec![invitation(2)]).len(), 1);
    }

    #[test]
    fn only_hangups_newer_than_the_invitation_withdraw_it() {
        let signal = |id, kind| Signal {
            id,
            from_user: "alice".into(),
            from_username: "alice".into(),
            from_avatar_ref: None,
            kind,
            payload: serde_json::json!({ "ended": true }),
            call_kind: CallKind::Video,
        };

        let mut reported = HashSet::from([5]);
        let events = screen_incoming(
            &mut reported,
            vec![signal(3, SignalKind::CallEnded), signal(5, SignalKind::CallRequest)],
        );
        assert!(events.is_empty());

        let events = screen_incoming(
            &mut reported,
            vec![signal(5, SignalKind::CallRequest), signal(6, SignalKind::CallEnded)],
        );
        assert!(matches!(events.as_slice(), [PresenceEvent::InvitationWithdrawn(s)] if s.id == 6));
    }
}
