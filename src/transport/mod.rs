//! Bidirectional stream to the realtime conversation service.

pub mod client;
pub mod messages;
pub mod token;

pub use client::{TransportCounters, TransportHandle, TransportSession};
pub use messages::{ClientMessage, EventParseError, ServerEvent, SessionParams};
pub use token::{fetch_session_token, SessionToken};
