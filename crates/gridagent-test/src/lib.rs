//! Test harnesses for the GridAgent server.
//!
//! Provides `TestServer`, an in-process server on an ephemeral port with an
//! in-memory bus, and `TestAgent`, a simulated agent speaking the client
//! side of the protocol.

pub mod agent;
#[cfg(test)]
mod scenarios;
pub mod server;

pub use agent::TestAgent;
pub use server::{TestError, TestServer, DEFAULT_TIMEOUT, TEST_SECRET};
