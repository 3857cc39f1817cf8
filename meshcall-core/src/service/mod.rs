pub mod directory;
pub mod events;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod subscription;
pub mod webrtc;

pub use directory::{DirectoryEvent, MemoryDirectory, RoomDirectory};
pub use events::PeerEvent;
pub use loopback::LoopbackNetwork;
pub use media::{LocalMediaSource, LocalTrack, MediaStreamHandle, RemoteStream, RemoteTrack, TrackKind};
pub use peer::{
    EnvelopeOutcome, PeerSessionManager, PeerTransport, PeerTransportFactory, SessionSnapshot,
    SessionState,
};
pub use room::{RoomController, RoomServices};
pub use signaling::{MemoryRelay, SignalingTransport};
pub use subscription::Subscription;
pub use self::webrtc::{SyntheticMediaSource, WebRtcTransportFactory};
