pub mod manager;
pub mod session;
pub mod transport;

pub use manager::{EnvelopeOutcome, PeerSessionManager};
pub use session::{SessionRole, SessionSnapshot, SessionState};
pub use transport::{
    PeerTransport, PeerTransportFactory, TransportEvent, TransportEvents, TransportNotice,
    TransportState,
};
