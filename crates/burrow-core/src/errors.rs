//! Error types for the Burrow tunneling protocol
//!
//! This module contains all error types used throughout the crate: wire codec
//! errors, port-policy errors, socket transport errors, and the main
//! BurrowError type that unifies them all.
//!
//! None of these conditions are process-fatal. Policy and transport errors
//! attached to one virtual socket are relayed to the remote peer as wire
//! messages; protocol-level anomalies (a message for an unknown socket id)
//! are tolerated by the dispatch layer and never surface here at all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Wire codec error types
#[derive(Debug, thiserror::Error)]
pub enum WireFormatError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("frame has {extra} trailing bytes")]
    TrailingData { extra: usize },

    #[error("payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },

    #[error("structured payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Port allow-list policy error types
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("port {port} not allowed")]
    PortNotAllowed { port: u16 },
}

/// Virtual socket transport error types
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {duration_ms}ms")]
    ConnectTimeout { duration_ms: u64 },

    #[error("peer channel closed")]
    ChannelClosed,

    #[error("peer not registered: {peer}")]
    PeerNotRegistered { peer: String },

    #[error("socket has no connection parameters")]
    MissingConnectParams,
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Burrow tunneling protocol
#[derive(Debug, thiserror::Error)]
pub enum BurrowError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireFormatError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BurrowError {
    /// Create a port-policy error
    pub fn port_not_allowed(port: u16) -> Self {
        BurrowError::Policy(PolicyError::PortNotAllowed { port })
    }

    /// Create a closed-channel error
    pub fn channel_closed() -> Self {
        BurrowError::Socket(SocketError::ChannelClosed)
    }

    /// Create a peer-not-registered error
    pub fn peer_not_registered<P: Into<String>>(peer: P) -> Self {
        BurrowError::Socket(SocketError::PeerNotRegistered { peer: peer.into() })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BurrowError::Configuration {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type BurrowResult<T> = core::result::Result<T, BurrowError>;
