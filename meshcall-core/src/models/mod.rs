pub mod id;
pub mod participant;
pub mod signal;

pub use id::{generate_id, ParticipantId, RoomId};
pub use participant::{LocalParticipant, Participant};
pub use signal::{
    IceCandidate, SdpType, SessionDescription, Signal, SignalKind, SignalingEnvelope, WireSignal,
};
