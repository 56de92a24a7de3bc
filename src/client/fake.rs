//! In-memory stand-ins for the signaling service and the media stack,
//! cheap enough to run under paused time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::error::ClientError;
use crate::client::media::{
    ConnectionState, LocalMedia, MediaAccessError, MediaConstraints, MediaDevices, PeerConnection,
    PeerConnectionFactory, PeerEvent,
};
use crate::client::transport::SignalingTransport;
use crate::signal::{
    CallKind, IceCandidate, OutgoingSignal, PresenceEntry, SessionDescription, Signal, SignalKind, SignalPayload,
    UserStatus,
};

struct Stored {
    to_user: String,
    signal: Signal,
    consumed: bool,
}

#[derive(Default)]
struct MailboxState {
    next_id: i64,
    signals: Vec<Stored>,
    status: HashMap<String, UserStatus>,
    failing_fetches: u32,
}

/// Mailbox with the same sticky and busy rules as the real one.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl MemoryMailbox {
    pub fn with_users(users: &[&str]) -> Self {
        let mailbox = Self::default();
        {
            let mut state = mailbox.state.lock().unwrap();
            for user in users {
                state.status.insert(user.to_string(), UserStatus::Online);
            }
        }
        mailbox
    }

    pub fn transport_for(&self, user: &str) -> Arc<dyn SignalingTransport> {
        Arc::new(MailboxClient {
            mailbox: self.clone(),
            user: user.to_string(),
        })
    }

    pub fn status_of(&self, user: &str) -> UserStatus {
        self.state.lock().unwrap().status[user]
    }

    pub fn set_status(&self, user: &str, status: UserStatus) {
        self.state.lock().unwrap().status.insert(user.to_string(), status);
    }

    /// Makes the next `n` fetches fail with a network timeout.
    pub fn fail_fetches(&self, n: u32) {
        self.state.lock().unwrap().failing_fetches = n;
    }

    /// Every signal ever addressed to `user` of `kind`, consumed or not.
    pub fn sent_to(&self, user: &str, kind: SignalKind) -> Vec<Signal> {
        self.state
            .lock()
            .unwrap()
            .signals
            .iter()
            .filter(|s| s.to_user == user && s.signal.kind == kind)
            .map(|s| s.signal.clone())
            .collect()
    }

    /// Signals still sitting in `user`'s inbox.
    pub fn pending_for(&self, user: &str) -> Vec<Signal> {
        self.state
            .lock()
            .unwrap()
            .signals
            .iter()
            .filter(|s| s.to_user == user && !s.consumed)
            .map(|s| s.signal.clone())
            .collect()
    }

    /// Sends a signal as `from`, standing in for the remote participant.
    pub fn post(&self, from: &str, to: &str, kind: SignalKind, payload: SignalPayload) -> i64 {
        self.insert(from, to, kind, payload.to_value(), CallKind::Video)
    }

    fn insert(&self, from: &str, to: &str, kind: SignalKind, payload: serde_json::Value, call_kind: CallKind) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.signals.push(Stored {
            to_user: to.to_string(),
            signal: Signal {
                id,
                from_user: from.to_string(),
                from_username: from.to_string(),
                from_avatar_ref: None,
                kind,
                payload,
                call_kind,
            },
            consumed: false,
        });
        id
    }
}

struct MailboxClient {
    mailbox: MemoryMailbox,
    user: String,
}

#[async_trait]
impl SignalingTransport for MailboxClient {
    async fn list_users(&self) -> Result<Vec<PresenceEntry>, ClientError> {
        let state = self.mailbox.state.lock().unwrap();
        let mut users: Vec<_> = state
            .status
            .iter()
            .filter(|(id, _)| **id != self.user)
            .map(|(id, status)| PresenceEntry {
                id: id.clone(),
                username: id.clone(),
                avatar_ref: None,
                status: *status,
                last_seen: None,
            })
            .collect();
        users.sort_by(|a, b| (a.status.tier(), &a.username).cmp(&(b.status.tier(), &b.username)));
        Ok(users)
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ClientError> {
        self.mailbox.set_status(&self.user, status);
        Ok(())
    }

    async fn send_signal(&self, signal: &OutgoingSignal) -> Result<i64, ClientError> {
        if signal.kind == SignalKind::CallRequest {
            return self.send_call_request(&signal.to_user, signal.call_kind).await;
        }
        Ok(self
            .mailbox
            .insert(&self.user, &signal.to_user, signal.kind, signal.payload.clone(), signal.call_kind))
    }

    async fn send_call_request(&self, to_user: &str, call_kind: CallKind) -> Result<i64, ClientError> {
        match self.mailbox.state.lock().unwrap().status.get(to_user) {
            None => return Err(ClientError::NotFound(to_user.to_string())),
            Some(UserStatus::OnCall) => return Err(ClientError::Busy),
            Some(_) => {}
        }
        let payload = SignalPayload::Invitation { call_kind }.to_value();
        Ok(self.mailbox.insert(&self.user, to_user, SignalKind::CallRequest, payload, call_kind))
    }

    async fn fetch_signals(&self) -> Result<Vec<Signal>, ClientError> {
        let mut state = self.mailbox.state.lock().unwrap();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ClientError::NetworkTimeout("fetch".to_string()));
        }

        let mut fetched = Vec::new();
        for stored in state.signals.iter_mut() {
            if stored.to_user == self.user && !stored.consumed {
                fetched.push(stored.signal.clone());
                if !stored.signal.kind.is_sticky() {
                    stored.consumed = true;
                }
            }
        }
        Ok(fetched)
    }

    async fn delete_signals(&self, from_user: &str, kind: Option<SignalKind>) -> Result<u64, ClientError> {
        let mut state = self.mailbox.state.lock().unwrap();
        let before = state.signals.len();
        state.signals.retain(|s| {
            !(s.to_user == self.user
                && s.signal.from_user == from_user
                && kind.map_or(true, |k| s.signal.kind == k))
        });
        Ok((before - state.signals.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MediaLog {
    pub requests: Vec<MediaConstraints>,
    pub stopped: u32,
    pub video_enabled: Option<bool>,
    pub audio_enabled: Option<bool>,
}

/// Capture devices whose camera (or everything) can be made to fail.
#[derive(Clone, Default)]
pub struct FakeMediaDevices {
    pub camera_error: Option<MediaAccessError>,
    pub device_error: Option<MediaAccessError>,
    pub log: Arc<Mutex<MediaLog>>,
}

impl FakeMediaDevices {
    pub fn log(&self) -> std::sync::MutexGuard<'_, MediaLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Box<dyn LocalMedia>, MediaAccessError> {
        self.log.lock().unwrap().requests.push(constraints);
        if let Some(e) = &self.device_error {
            return Err(e.clone());
        }
        if let (true, Some(e)) = (constraints.video, &self.camera_error) {
            return Err(e.clone());
        }
        Ok(Box::new(FakeMedia {
            constraints,
            log: self.log.clone(),
            stopped: false,
        }))
    }
}

struct FakeMedia {
    constraints: MediaConstraints,
    log: Arc<Mutex<MediaLog>>,
    stopped: bool,
}

impl LocalMedia for FakeMedia {
    fn constraints(&self) -> MediaConstraints {
        self.constraints
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.log.lock().unwrap().video_enabled = Some(enabled);
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.log.lock().unwrap().audio_enabled = Some(enabled);
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.log.lock().unwrap().stopped += 1;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PeerLog {
    pub local: Vec<SessionDescription>,
    pub remote: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

/// Test-side grip on one created connection.
#[derive(Clone)]
pub struct PeerProbe {
    events: mpsc::Sender<PeerEvent>,
    log: Arc<Mutex<PeerLog>>,
}

impl PeerProbe {
    pub async fn set_state(&self, state: ConnectionState) {
        let _ = self.events.send(PeerEvent::StateChanged(state)).await;
    }

    pub async fn gather(&self, candidate: IceCandidate) {
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate)).await;
    }

    pub fn log(&self) -> PeerLog {
        self.log.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub struct FakePeerFactory {
    peers: Arc<Mutex<Vec<PeerProbe>>>,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> PeerProbe {
        self.peers.lock().unwrap()[index].clone()
    }

    pub fn latest(&self) -> PeerProbe {
        self.peers.lock().unwrap().last().cloned().expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _sending: MediaConstraints,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, ClientError> {
        let log = Arc::new(Mutex::new(PeerLog::default()));
        self.peers.lock().unwrap().push(PeerProbe {
            events,
            log: log.clone(),
        });
        Ok(Box::new(FakePeer { log }))
    }
}

struct FakePeer {
    log: Arc<Mutex<PeerLog>>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, ClientError> {
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, ClientError> {
        if self.log.lock().unwrap().remote.is_empty() {
            return Err(ClientError::Peer("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), ClientError> {
        self.log.lock().unwrap().local.push(description);
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), ClientError> {
        self.log.lock().unwrap().remote.push(description);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        !self.log.lock().unwrap().remote.is_empty()
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), ClientError> {
        let mut log = self.log.lock().unwrap();
        if log.remote.is_empty() {
            return Err(ClientError::Peer("candidate before remote description".to_string()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}
