//! Network streaming
//!
//! [`Transport`] abstracts the wire protocol (one production RTMP
//! implementation, one test double); [`NetworkSession`] owns the
//! connect/reconnect state machine and gates sample delivery.

pub mod session;
pub mod transport;

pub use session::{NetworkSession, SessionState};
pub use transport::{RtmpTransport, Transport};
