//! # Streaming Assessment Sessions
//!
//! Everything between "a client connected" and "the client got its score" lives here,
//! independent of the HTTP framework:
//!
//! - **classifier**: picks the engine's evaluation mode from the reference text
//! - **protocol**: config, control and status frames on the wire
//! - **transport**: the seam to the client connection
//! - **pump**: the reader worker and the serialized responder
//! - **session**: the state machine tying it all together
//!
//! ## Data Flow:
//! ```text
//! WebSocket actor ──inbound channel──> ReaderWorker ──> engine
//!        ^                                                │
//!        └──outbound channel── Responder <── SessionListener
//! ```

pub mod classifier;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod transport;

pub use protocol::StatusFrame;
pub use pump::Responder;
pub use session::{AssessmentSession, SessionOutcome};
pub use transport::{
    ChannelReceiver, ChannelSender, InboundItem, OutboundCommand, TransportError,
    TransportMessage,
};
