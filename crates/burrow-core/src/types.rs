//! Core types for the Burrow tunneling protocol
//!
//! This module defines the fundamental identifier types used throughout the
//! protocol, using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Socket Identifier
// ----------------------------------------------------------------------------

/// Identifier for one virtual socket, unique within the allocating process
///
/// Each side of a tunnel assigns its own identifiers; the two halves of the
/// addressing pair on every wire message are [`SocketId`]s from the two
/// independent spaces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SocketId(u32);

impl SocketId {
    /// Sentinel for a not-yet-assigned remote identifier
    pub const UNASSIGNED: Self = Self(0);

    /// Create a new SocketId from a raw value
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Whether this identifier has been assigned yet
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SocketId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Peer Key
// ----------------------------------------------------------------------------

/// Stable public key identifying a remote peer
///
/// The hex rendering produced by `Display` is the deterministic string form
/// used in logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
    /// Create a new peer key from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerKey {
    type Err = crate::BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);

        let bytes = hex::decode(clean_str)
            .map_err(|_| crate::BurrowError::config_error("Invalid hex in PeerKey"))?;

        if bytes.len() != 32 {
            return Err(crate::BurrowError::config_error(
                "PeerKey must be exactly 32 bytes",
            ));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }
}

impl Deref for PeerKey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Socket Request (addressing pair)
// ----------------------------------------------------------------------------

/// The `(id, remote_id)` addressing pair carried on every wire message
///
/// `id` is the identifier meaningful to the sender; `remote_id` is the
/// identifier meaningful to the recipient. The recipient therefore looks
/// sockets up by the decoded `remote_id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketRequest {
    /// Sender-meaningful socket identifier
    pub id: SocketId,
    /// Recipient-meaningful socket identifier
    pub remote_id: SocketId,
}

impl SocketRequest {
    /// Create a new addressing pair
    pub fn new(id: SocketId, remote_id: SocketId) -> Self {
        Self { id, remote_id }
    }

    /// Addressing pair for an open request whose remote half is still unknown
    pub fn unpaired(id: SocketId) -> Self {
        Self {
            id,
            remote_id: SocketId::UNASSIGNED,
        }
    }

    /// The same pair as seen from the other side of the tunnel
    pub fn flipped(&self) -> Self {
        Self {
            id: self.remote_id,
            remote_id: self.id,
        }
    }
}

impl fmt::Display for SocketRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.remote_id)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id() {
        let id = SocketId::new(7);
        assert_eq!(id.value(), 7);
        assert!(id.is_assigned());
        assert!(!SocketId::UNASSIGNED.is_assigned());
    }

    #[test]
    fn test_peer_key_hex_roundtrip() {
        let key = PeerKey::new([0xab; 32]);
        let rendered = key.to_string();
        assert_eq!(rendered.len(), 64);

        let parsed: PeerKey = rendered.parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_peer_key_rejects_short_hex() {
        assert!("abcd".parse::<PeerKey>().is_err());
    }

    #[test]
    fn test_socket_request_flipped() {
        let request = SocketRequest::new(SocketId::new(5), SocketId::new(9));
        let flipped = request.flipped();
        assert_eq!(flipped.id, SocketId::new(9));
        assert_eq!(flipped.remote_id, SocketId::new(5));
    }
}
