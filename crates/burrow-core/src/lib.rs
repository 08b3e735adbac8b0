//! Burrow Core Protocol Implementation
//!
//! This crate provides the foundational types, wire codec, identifier
//! allocation, and configuration for the Burrow TCP tunneling protocol,
//! which multiplexes raw TCP connections over a single reliable, ordered
//! peer-to-peer channel. The runtime engine that drives virtual sockets
//! lives in `burrow-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod allocator;
pub mod config;
pub mod errors;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use allocator::SocketIdAllocator;
pub use config::TunnelConfig;
pub use errors::{BurrowError, BurrowResult, PolicyError, SocketError, WireFormatError};
pub use types::{PeerKey, SocketId, SocketRequest};
pub use wire::{ConnectParams, MessageKind, TunnelErrorKind, WireError, WireMessage};
