//! Server error types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gridagent_protocol::{AgentId, ErrorKind, ProtocolError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that end a connection before or outside the frame loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("write failed: {0}")]
    Write(#[source] ProtocolError),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}

impl SessionError {
    /// Label for the protocol error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Handshake(e) | SessionError::Write(e) => e.kind().as_str(),
            SessionError::HandshakeTimeout(_) => "handshake_timeout",
            SessionError::WriteTimeout(_) => "write_timeout",
        }
    }
}

/// Why an outbound message did not reach a session's queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no live session for agent {0}")]
    NoSession(AgentId),

    #[error("outbound queue full")]
    QueueFull,

    #[error("timed out waiting for outbound queue space")]
    Timeout,

    #[error("session closed")]
    Closed,
}

impl DeliveryError {
    /// Label for the dropped delivery counter.
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::NoSession(_) => "no_session",
            DeliveryError::QueueFull => "queue_full",
            DeliveryError::Timeout => "timeout",
            DeliveryError::Closed => "session_closed",
        }
    }
}

/// Bus transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("bus closed")]
    Closed,
}

/// Errors raised while turning a bus command into downstream messages.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("command for agent {agent} published under routing key {subject:?}")]
    WrongRoutingKey { agent: AgentId, subject: String },

    #[error("software image {} not found", .0.display())]
    SoftwareImageMissing(PathBuf),

    #[error("version suffix {0:?} cannot be part of an image file name")]
    InvalidVersionExtra(String),

    #[error("failed to read software image {}: {source}", path.display())]
    SoftwareImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message} for agent {agent} not supported at protocol version {version}")]
    NotSupported {
        agent: AgentId,
        message: &'static str,
        version: u32,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Why a registered session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent closed the connection.
    PeerClosed,
    /// No inbound frame within the idle timeout.
    IdleTimeout,
    /// A frame could not be decoded.
    Protocol(ErrorKind),
    /// A newer session for the same agent took over.
    Displaced,
    /// The server is shutting down.
    Shutdown,
    /// The previous measurement poll went unanswered.
    PollTimeout,
    /// Writing to the agent failed or timed out.
    WriteFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Protocol(kind) => kind.as_str(),
            CloseReason::Displaced => "displaced",
            CloseReason::Shutdown => "shutdown",
            CloseReason::PollTimeout => "poll_timeout",
            CloseReason::WriteFailed => "write_failed",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
