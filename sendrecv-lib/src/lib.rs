pub mod candidate;
pub mod command;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod negotiation;
pub mod signaling;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
