//! Client side of calling: the transport to the signaling service, the call
//! lifecycle, the per-call engine and the presence pump.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod media;
pub mod pump;
pub mod relay;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use coordinator::{CallCoordinator, CallState, CallTransition, Direction, PollOutcome};
pub use engine::{CallEnd, CallEngine, CallHandle, EngineConfig, EngineEvent, EnginePhase, IceCandidateQueue};
pub use error::ClientError;
pub use media::{ConnectionState, LocalMedia, MediaAccessError, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionFactory, PeerEvent};
pub use pump::{PresenceEvent, PresencePump, PumpConfig, PumpHandle};
pub use relay::NegotiationRelay;
pub use retry::{retry, RetryPolicy};
pub use transport::{HttpTransport, LocalTransport, SignalingTransport};
