//! imserver Protocol - Envelope and wire definitions
//!
//! This crate defines what travels over a relay connection:
//! - `Envelope`: the JSON object exchanged between peers
//! - user id validation for the `/imserver/{userId}` path segment
//! - the fixed text literals the server emits
//!
//! Everything here is transport-agnostic; the daemon owns routing.

mod envelope;
mod validation;

pub use envelope::*;
pub use validation::*;

/// Sent to a connection right after it is registered
pub const WELCOME_TEXT: &str = "连接成功";

/// Body of a successful push acknowledgment
pub const PUSH_ACK_TEXT: &str = "MSG SEND SUCCESS";

/// Envelope key holding the sender id (always stamped server-side)
pub const FROM_USER_ID: &str = "fromUserId";

/// Envelope key holding the recipient id
pub const TO_USER_ID: &str = "toUserId";
