//! webrtc-rs adapters: real peer connections and a synthetic capture source

pub mod media;
pub mod transport;

pub use media::SyntheticMediaSource;
pub use transport::{WebRtcPeerTransport, WebRtcTransportFactory};
