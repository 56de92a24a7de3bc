//! Capabilities the call engine drives but does not implement: local
//! capture devices and the WebRTC peer connection.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::error::ClientError;
use crate::signal::{CallKind, IceCandidate, SessionDescription};

/// What to capture, and what the peer connection should send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_call(call_kind: CallKind) -> Self {
        Self {
            audio: true,
            video: call_kind == CallKind::Video,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to use the device was denied")]
    NotAllowed,

    #[error("no matching capture device")]
    NotFound,

    #[error("capture device is in use or unreadable")]
    NotReadable,

    #[error("{0}")]
    Other(String),
}

impl MediaAccessError {
    /// Camera trouble that an audio-only retry can route around.
    pub fn permits_audio_fallback(&self) -> bool {
        matches!(
            self,
            MediaAccessError::NotAllowed | MediaAccessError::NotFound | MediaAccessError::NotReadable
        )
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Box<dyn LocalMedia>, MediaAccessError>;
}

/// Captured local tracks. `stop` releases the devices and must be idempotent.
pub trait LocalMedia: Send + Sync {
    fn constraints(&self) -> MediaConstraints;
    fn set_video_enabled(&mut self, enabled: bool);
    fn set_audio_enabled(&mut self, enabled: bool);
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&mut self) -> Result<SessionDescription, ClientError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, ClientError>;
    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), ClientError>;
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), ClientError>;
    fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), ClientError>;
    /// Must be idempotent.
    fn close(&mut self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Opens a connection sending the given tracks. Candidates and state
    /// changes are reported on `events`.
    async fn create(
        &self,
        sending: MediaConstraints,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, ClientError>;
}
