/// Errors produced while interpreting replies.
pub mod error;
/// Pub/Sub messages.
pub mod pubsub;
/// Sentinel replies and events.
pub mod sentinel;

pub use error::{Error, Result};
