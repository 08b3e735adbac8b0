//! Burrow Runtime Engine
//!
//! This crate contains the engine for the Burrow tunneling protocol:
//! - [`PeerRegistry`]: the per-process table of peers and active virtual
//!   sockets, and the dispatch point for every inbound wire message
//! - [`VirtualSocket`]: one tunneled TCP connection, bridging OS socket
//!   events to outbound wire messages
//! - [`TunnelStream`]: the caller-facing byte stream for locally-initiated
//!   tunnels
//! - the [`PeerChannel`] seam toward the external swarm/transport layer
//!
//! `burrow-core` provides the stable protocol definitions; this crate
//! orchestrates them.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod registry;
pub mod socket;
pub mod stream;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    frame_channel, FrameReceiver, FrameSender, MessageHandle, MpscChannel, PeerChannel,
    PeerMessages,
};
pub use registry::{PeerEntity, PeerRegistry, PeerUpdate};
pub use socket::{SocketState, VirtualSocket};
pub use stream::TunnelStream;

// Re-export core types for convenience
pub use burrow_core::{
    BurrowError, BurrowResult, ConnectParams, MessageKind, PeerKey, SocketId, SocketRequest,
    TunnelConfig, TunnelErrorKind, WireError, WireMessage,
};
