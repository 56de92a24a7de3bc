//! Per-participant driver of one call: acquires media, runs offer/answer/ICE
//! over the mailbox, reconnects with backoff and tears everything down on
//! the way out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::coordinator::{prioritize_hangups, CallCoordinator, CallState, CallTransition, Direction};
use crate::client::error::ClientError;
use crate::client::media::{
    ConnectionState, LocalMedia, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionFactory, PeerEvent,
};
use crate::client::relay::NegotiationRelay;
use crate::client::retry::RetryPolicy;
use crate::client::transport::FETCH_TIMEOUT;
use crate::signal::{IceCandidate, SessionDescription, Signal, SignalKind, SignalPayload};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    /// Attempts and backoff for re-establishing a dropped connection.
    pub reconnect: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            fetch_timeout: FETCH_TIMEOUT,
            connect_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                multiplier: 2,
                max_delay: Duration::from_secs(10),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    MediaAcquiring,
    /// Initiator waiting for the callee to answer the invitation.
    Ringing,
    Offering,
    AwaitingOffer,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Phase(EnginePhase),
    /// The camera could not be used; the call continues audio-only.
    AudioOnly,
    /// The receiver has its media and is waiting for an offer.
    PeerReady,
    Reconnecting { attempt: u32, delay: Duration },
    RemoteVideo { enabled: bool },
    RemoteAudio { enabled: bool },
}

/// How a call that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    LocalHangup,
    RemoteHangup,
    /// This side withdrew an unanswered invitation.
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    SetVideo(bool),
    SetAudio(bool),
    HangUp,
}

/// Local controls for a running call.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    cancel: CancellationToken,
}

impl CallHandle {
    async fn send(&self, command: CallCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::InvalidState("call is over".to_string()))
    }

    pub async fn set_video(&self, enabled: bool) -> Result<(), ClientError> {
        self.send(CallCommand::SetVideo(enabled)).await
    }

    pub async fn set_audio(&self, enabled: bool) -> Result<(), ClientError> {
        self.send(CallCommand::SetAudio(enabled)).await
    }

    pub async fn hang_up(&self) -> Result<(), ClientError> {
        self.send(CallCommand::HangUp).await
    }

    /// Ends the call as a local hangup without waiting for the command queue.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// ICE candidates that arrived before there was a remote description to
/// apply them to.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empties the queue, oldest first.
    pub fn take(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }
}

/// Owns the local media and the peer connection. Dropping it stops and
/// closes both, whichever way the call ends.
#[derive(Default)]
struct CallResources {
    media: Option<Box<dyn LocalMedia>>,
    peer: Option<Box<dyn PeerConnection>>,
}

impl CallResources {
    fn peer_mut(&mut self) -> Result<&mut Box<dyn PeerConnection>, ClientError> {
        self.peer
            .as_mut()
            .ok_or_else(|| ClientError::Peer("no open peer connection".to_string()))
    }

    fn close_peer(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
    }

    fn release(&mut self) {
        self.close_peer();
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
    }
}

impl Drop for CallResources {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Receiver,
}

pub struct CallEngine {
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    config: EngineConfig,
}

impl CallEngine {
    pub fn new(devices: Arc<dyn MediaDevices>, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            devices,
            factory,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the call on its own task. The caller passes a coordinator that
    /// has just sent an invitation (initiator) or accepted one (receiver).
    pub fn spawn(
        self,
        coordinator: CallCoordinator,
        cancel: CancellationToken,
    ) -> (
        CallHandle,
        mpsc::UnboundedReceiver<EngineEvent>,
        JoinHandle<Result<CallEnd, ClientError>>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            commands: command_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(self.run(coordinator, command_rx, event_tx, cancel));
        (handle, event_rx, task)
    }

    pub async fn run(
        self,
        coordinator: CallCoordinator,
        mut commands: mpsc::Receiver<CallCommand>,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Result<CallEnd, ClientError> {
        let role = match coordinator.state() {
            CallState::Ringing {
                direction: Direction::Outgoing,
            } => Role::Initiator,
            CallState::Negotiating => Role::Receiver,
            other => {
                return Err(ClientError::InvalidState(format!(
                    "cannot start a call engine while {:?}",
                    other
                )))
            }
        };

        let mut session = CallSession {
            relay: coordinator.relay().clone(),
            coordinator,
            factory: self.factory,
            devices: self.devices,
            config: self.config,
            role,
            phase: EnginePhase::MediaAcquiring,
            resources: CallResources::default(),
            queue: IceCandidateQueue::default(),
            peer_events: None,
            sending: MediaConstraints::audio_only(),
            connect_deadline: None,
            reconnect_at: None,
            reconnect_attempts: 0,
            pending_video: None,
            pending_audio: None,
            events,
        };

        tracing::info!(peer = %session.coordinator.peer(), ?role, "call engine started");
        let result = session.drive(&mut commands, &cancel).await;
        session.resources.release();

        match &result {
            Ok(end) => tracing::info!(peer = %session.coordinator.peer(), ?end, "call finished"),
            Err(e) => {
                tracing::warn!(peer = %session.coordinator.peer(), "call failed: {}", e);
                session.coordinator.finish().await;
            }
        }

        session.set_phase(EnginePhase::Ended);
        result
    }
}

struct CallSession {
    coordinator: CallCoordinator,
    relay: NegotiationRelay,
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    config: EngineConfig,
    role: Role,
    phase: EnginePhase,
    resources: CallResources,
    queue: IceCandidateQueue,
    /// Events of the current peer connection only; replaced on reopen.
    peer_events: Option<mpsc::Receiver<PeerEvent>>,
    sending: MediaConstraints,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    pending_video: Option<bool>,
    pending_audio: Option<bool>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl CallSession {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "engine phase");
            self.phase = phase;
            self.emit(EngineEvent::Phase(phase));
        }
    }

    fn arm_connect_deadline(&mut self) {
        if self.connect_deadline.is_none() {
            self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        }
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::Receiver<CallCommand>,
        cancel: &CancellationToken,
    ) -> Result<CallEnd, ClientError> {
        self.emit(EngineEvent::Phase(EnginePhase::MediaAcquiring));
        self.acquire_media().await?;

        match self.role {
            Role::Initiator => self.set_phase(EnginePhase::Ringing),
            Role::Receiver => {
                if let Err(e) = self.relay.send_ready().await {
                    tracing::warn!("failed to send receiver-ready: {}", e);
                }
                self.arm_connect_deadline();
                self.set_phase(EnginePhase::AwaitingOffer);
            }
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return self.hang_up_locally().await,

                command = commands.recv() => match command {
                    Some(CallCommand::SetVideo(enabled)) => self.toggle_local(SignalKind::VideoStatus, enabled).await,
                    Some(CallCommand::SetAudio(enabled)) => self.toggle_local(SignalKind::AudioStatus, enabled).await,
                    Some(CallCommand::HangUp) | None => return self.hang_up_locally().await,
                },

                _ = sleep_until_opt(self.connect_deadline) => {
                    return Err(ClientError::ConnectTimeout(self.config.connect_timeout));
                }

                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reopen().await?;
                }

                event = recv_opt(&mut self.peer_events) => match event {
                    Some(event) => self.on_peer_event(event).await?,
                    None => self.peer_events = None,
                },

                _ = ticker.tick() => {
                    if let Some(end) = self.poll_signals().await? {
                        return Ok(end);
                    }
                }
            }
        }
    }

    async fn acquire_media(&mut self) -> Result<(), ClientError> {
        let wanted = MediaConstraints::for_call(self.coordinator.call_kind());

        let media = match self.devices.acquire(wanted).await {
            Ok(media) => media,
            Err(e) if wanted.video && e.permits_audio_fallback() => {
                tracing::warn!("camera unavailable ({}), continuing audio-only", e);
                let media = self.devices.acquire(MediaConstraints::audio_only()).await?;
                self.emit(EngineEvent::AudioOnly);
                media
            }
            Err(e) => return Err(e.into()),
        };

        self.sending = media.constraints();
        self.resources.media = Some(media);
        Ok(())
    }

    async fn hang_up_locally(&mut self) -> Result<CallEnd, ClientError> {
        match self.coordinator.state() {
            CallState::Ringing {
                direction: Direction::Outgoing,
            } => {
                self.coordinator.cancel().await?;
                Ok(CallEnd::Cancelled)
            }
            _ => {
                self.coordinator.hang_up().await?;
                Ok(CallEnd::LocalHangup)
            }
        }
    }

    async fn toggle_local(&mut self, kind: SignalKind, enabled: bool) {
        if let Some(media) = self.resources.media.as_mut() {
            if kind == SignalKind::VideoStatus {
                media.set_video_enabled(enabled);
            } else {
                media.set_audio_enabled(enabled);
            }
        }

        let relayed = if kind == SignalKind::VideoStatus {
            self.relay.send_video_status(enabled).await
        } else {
            self.relay.send_audio_status(enabled).await
        };
        if let Err(e) = relayed {
            tracing::warn!(%kind, "failed to relay toggle: {}", e);
        }
    }

    async fn poll_signals(&mut self) -> Result<Option<CallEnd>, ClientError> {
        let fetched = tokio::time::timeout(
            self.config.fetch_timeout,
            self.coordinator.transport().fetch_signals(),
        )
        .await;

        let mut batch = match fetched {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) if e.is_transient() => {
                tracing::warn!("signal fetch failed, retrying next tick: {}", e);
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!("signal fetch timed out");
                return Ok(None);
            }
        };

        prioritize_hangups(&mut batch);

        for signal in batch {
            if signal.from_user != self.coordinator.peer() {
                tracing::trace!(signal_id = signal.id, "ignoring signal from outside the call");
                continue;
            }
            if let Some(end) = self.on_signal(signal).await? {
                return Ok(Some(end));
            }
        }
        Ok(None)
    }

    async fn on_signal(&mut self, signal: Signal) -> Result<Option<CallEnd>, ClientError> {
        match signal.kind {
            SignalKind::CallAccepted | SignalKind::CallRejected | SignalKind::CallEnded => {
                match self.coordinator.handle(&signal).await? {
                    Some(CallTransition::Accepted) => {
                        self.start_offer().await?;
                        Ok(None)
                    }
                    Some(CallTransition::Rejected) => Ok(Some(CallEnd::Rejected)),
                    Some(CallTransition::Ended) | Some(CallTransition::Withdrawn) => Ok(Some(CallEnd::RemoteHangup)),
                    None => Ok(None),
                }
            }
            SignalKind::ReceiverReady => {
                self.emit(EngineEvent::PeerReady);
                Ok(None)
            }
            SignalKind::CallRequest => Ok(None),
            kind => {
                let payload = match signal.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(signal_id = signal.id, "skipping undecodable signal: {}", e);
                        return Ok(None);
                    }
                };

                match payload {
                    SignalPayload::Description(offer) if kind == SignalKind::Offer => self.on_offer(offer).await?,
                    SignalPayload::Description(answer) => self.on_answer(answer).await?,
                    SignalPayload::Candidate(candidate) => self.on_remote_candidate(candidate).await,
                    SignalPayload::MediaToggle(toggle) => self.on_remote_toggle(kind, toggle.enabled),
                    _ => {}
                }
                Ok(None)
            }
        }
    }

    async fn open_peer(&mut self) -> Result<(), ClientError> {
        self.resources.close_peer();
        let (tx, rx) = mpsc::channel(64);
        let peer = self.factory.create(self.sending, tx).await?;
        self.resources.peer = Some(peer);
        self.peer_events = Some(rx);
        Ok(())
    }

    async fn start_offer(&mut self) -> Result<(), ClientError> {
        self.set_phase(EnginePhase::Offering);
        self.open_peer().await?;

        let offer = self.resources.peer_mut()?.create_offer().await?;
        self.resources.peer_mut()?.set_local_description(offer.clone()).await?;
        self.relay.send_offer(&offer).await?;

        self.arm_connect_deadline();
        self.set_phase(EnginePhase::Negotiating);
        Ok(())
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), ClientError> {
        if self.role != Role::Receiver {
            tracing::warn!("initiator ignoring unexpected offer");
            return Ok(());
        }

        // A second offer means the initiator restarted the connection.
        let reopen = self
            .resources
            .peer
            .as_ref()
            .map_or(true, |peer| peer.has_remote_description());
        if reopen {
            self.open_peer().await?;
        }
        // A fresh offer supersedes any reconnect we had scheduled.
        self.reconnect_at = None;

        self.resources.peer_mut()?.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.resources.peer_mut()?.create_answer().await?;
        self.resources.peer_mut()?.set_local_description(answer.clone()).await?;
        self.relay.send_answer(&answer).await?;

        self.arm_connect_deadline();
        self.set_phase(EnginePhase::Negotiating);
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), ClientError> {
        if self.role != Role::Initiator {
            tracing::warn!("receiver ignoring unexpected answer");
            return Ok(());
        }

        match self.resources.peer.as_mut() {
            Some(peer) if peer.has_remote_description() => {
                tracing::debug!("ignoring duplicate answer");
                return Ok(());
            }
            Some(peer) => peer.set_remote_description(answer).await?,
            None => {
                tracing::warn!("answer arrived without an open connection");
                return Ok(());
            }
        }

        self.flush_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.resources.peer.as_mut() {
            Some(peer) if peer.has_remote_description() => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!("failed to apply ICE candidate: {}", e);
                }
            }
            _ => {
                self.queue.push(candidate);
                tracing::trace!(queued = self.queue.len(), "queued early ICE candidate");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(peer) = self.resources.peer.as_mut() else {
            return;
        };

        let pending = self.queue.take();
        let count = pending.len();
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("failed to apply queued ICE candidate: {}", e);
            }
        }
        if count > 0 {
            tracing::debug!(count, "flushed early ICE candidates");
        }
    }

    fn on_remote_toggle(&mut self, kind: SignalKind, enabled: bool) {
        if self.phase != EnginePhase::Connected {
            tracing::debug!(%kind, enabled, "deferring remote toggle until connected");
            if kind == SignalKind::VideoStatus {
                self.pending_video = Some(enabled);
            } else {
                self.pending_audio = Some(enabled);
            }
            return;
        }

        if kind == SignalKind::VideoStatus {
            self.emit(EngineEvent::RemoteVideo { enabled });
        } else {
            self.emit(EngineEvent::RemoteAudio { enabled });
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), ClientError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.relay.send_candidate(&candidate).await {
                    tracing::warn!("failed to relay ICE candidate: {}", e);
                }
                Ok(())
            }
            PeerEvent::StateChanged(ConnectionState::Connected) => self.on_connected(),
            PeerEvent::StateChanged(state @ (ConnectionState::Disconnected | ConnectionState::Failed)) => {
                self.schedule_reconnect(state)
            }
            PeerEvent::StateChanged(state) => {
                tracing::trace!(?state, "peer connection state");
                Ok(())
            }
        }
    }

    fn on_connected(&mut self) -> Result<(), ClientError> {
        self.connect_deadline = None;
        self.reconnect_attempts = 0;
        if self.phase == EnginePhase::Connected {
            return Ok(());
        }

        self.coordinator.mark_connected()?;
        self.set_phase(EnginePhase::Connected);

        if let Some(enabled) = self.pending_video.take() {
            self.emit(EngineEvent::RemoteVideo { enabled });
        }
        if let Some(enabled) = self.pending_audio.take() {
            self.emit(EngineEvent::RemoteAudio { enabled });
        }
        Ok(())
    }

    fn schedule_reconnect(&mut self, state: ConnectionState) -> Result<(), ClientError> {
        if self.reconnect_at.is_some() {
            return Ok(());
        }

        self.reconnect_attempts += 1;
        let budget = self.config.reconnect.max_attempts;
        if self.reconnect_attempts > budget {
            return Err(ClientError::ConnectionFailed { attempts: budget });
        }

        let delay = self.config.reconnect.delay_for(self.reconnect_attempts);
        tracing::warn!(?state, attempt = self.reconnect_attempts, ?delay, "peer connection lost, reconnecting");

        self.resources.close_peer();
        self.peer_events = None;
        self.connect_deadline = None;
        self.reconnect_at = Some(Instant::now() + delay);

        let stale = self.queue.take().len();
        if stale > 0 {
            tracing::debug!(stale, "dropped ICE candidates of the lost connection");
        }

        self.set_phase(EnginePhase::Reconnecting);
        self.emit(EngineEvent::Reconnecting {
            attempt: self.reconnect_attempts,
            delay,
        });
        Ok(())
    }

    async fn reopen(&mut self) -> Result<(), ClientError> {
        if self.resources.peer.is_some() || self.phase == EnginePhase::Connected {
            return Ok(());
        }

        match self.role {
            Role::Initiator => self.start_offer().await,
            Role::Receiver => {
                self.arm_connect_deadline();
                self.set_phase(EnginePhase::AwaitingOffer);
                Ok(())
            }
        }
    }
}
