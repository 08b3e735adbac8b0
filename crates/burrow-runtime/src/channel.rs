//! Channel seam between the registry and the peer transport
//!
//! The swarm/transport layer is an external collaborator: all this crate
//! needs from it is a reliable, ordered frame pipe per peer. [`PeerChannel`]
//! is that seam. A [`MessageHandle`] binds one wire message kind to one
//! channel and encodes on send; [`PeerMessages`] is the closed five-slot
//! handle set kept per peer, populated one registration at a time.

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_core::wire::{MessageKind, WireMessage};
use burrow_core::{BurrowError, BurrowResult};

// ----------------------------------------------------------------------------
// Peer Channel Seam
// ----------------------------------------------------------------------------

/// One peer's established, reliable, ordered message channel
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send one encoded frame to the remote peer
    async fn send(&self, frame: Vec<u8>) -> BurrowResult<()>;
}

/// Sender half of a frame pipe feeding a [`PeerChannel`] or the registry's
/// inbound pump
pub type FrameSender = tokio::sync::mpsc::Sender<Vec<u8>>;

/// Receiver half of a frame pipe
pub type FrameReceiver = tokio::sync::mpsc::Receiver<Vec<u8>>;

/// Create a bounded frame pipe
pub fn frame_channel(depth: usize) -> (FrameSender, FrameReceiver) {
    tokio::sync::mpsc::channel(depth)
}

/// [`PeerChannel`] implementation over a bounded in-process frame pipe
///
/// Hosts bridge the sender side onto their real transport; tests wire two of
/// these back to back.
#[derive(Debug, Clone)]
pub struct MpscChannel {
    frames: FrameSender,
}

impl MpscChannel {
    /// Wrap the sender half of a frame pipe
    pub fn new(frames: FrameSender) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl PeerChannel for MpscChannel {
    async fn send(&self, frame: Vec<u8>) -> BurrowResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| BurrowError::channel_closed())
    }
}

// ----------------------------------------------------------------------------
// Message Handles
// ----------------------------------------------------------------------------

/// Send handle for one wire message kind on one peer's channel
#[derive(Clone)]
pub struct MessageHandle {
    kind: MessageKind,
    channel: Arc<dyn PeerChannel>,
}

impl MessageHandle {
    /// Bind a message kind to a channel
    pub fn new(kind: MessageKind, channel: Arc<dyn PeerChannel>) -> Self {
        Self { kind, channel }
    }

    /// The message kind this handle is bound to
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Encode and send one message through the underlying channel
    pub async fn send(&self, message: &WireMessage) -> BurrowResult<()> {
        debug_assert_eq!(message.kind(), self.kind);
        let frame = message.encode()?;
        self.channel.send(frame).await
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Per-Peer Handle Set
// ----------------------------------------------------------------------------

/// The per-peer set of message send handles, one slot per wire kind
///
/// Slots fill incrementally as each kind is registered; merging never clears
/// a previously registered slot.
#[derive(Debug, Clone, Default)]
pub struct PeerMessages {
    pub open: Option<MessageHandle>,
    pub write: Option<MessageHandle>,
    pub close: Option<MessageHandle>,
    pub timeout: Option<MessageHandle>,
    pub error: Option<MessageHandle>,
}

impl PeerMessages {
    /// A handle set with a single slot filled, for one registration call
    pub fn only(handle: MessageHandle) -> Self {
        let mut messages = Self::default();
        match handle.kind() {
            MessageKind::Open => messages.open = Some(handle),
            MessageKind::Write => messages.write = Some(handle),
            MessageKind::Close => messages.close = Some(handle),
            MessageKind::Timeout => messages.timeout = Some(handle),
            MessageKind::Error => messages.error = Some(handle),
        }
        messages
    }

    /// Look up the handle for a kind
    pub fn handle(&self, kind: MessageKind) -> Option<&MessageHandle> {
        match kind {
            MessageKind::Open => self.open.as_ref(),
            MessageKind::Write => self.write.as_ref(),
            MessageKind::Close => self.close.as_ref(),
            MessageKind::Timeout => self.timeout.as_ref(),
            MessageKind::Error => self.error.as_ref(),
        }
    }

    /// Merge another handle set into this one; filled incoming slots win,
    /// empty incoming slots leave existing registrations untouched
    pub fn merge(&mut self, incoming: PeerMessages) {
        if incoming.open.is_some() {
            self.open = incoming.open;
        }
        if incoming.write.is_some() {
            self.write = incoming.write;
        }
        if incoming.close.is_some() {
            self.close = incoming.close;
        }
        if incoming.timeout.is_some() {
            self.timeout = incoming.timeout;
        }
        if incoming.error.is_some() {
            self.error = incoming.error;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_channel() -> Arc<dyn PeerChannel> {
        let (tx, _rx) = frame_channel(1);
        Arc::new(MpscChannel::new(tx))
    }

    #[test]
    fn test_only_fills_single_slot() {
        let messages = PeerMessages::only(MessageHandle::new(MessageKind::Write, dummy_channel()));
        assert!(messages.write.is_some());
        assert!(messages.open.is_none());
        assert!(messages.close.is_none());
    }

    #[test]
    fn test_merge_keeps_existing_slots() {
        let channel = dummy_channel();
        let mut messages = PeerMessages::only(MessageHandle::new(MessageKind::Open, channel.clone()));
        messages.merge(PeerMessages::only(MessageHandle::new(
            MessageKind::Close,
            channel,
        )));

        assert!(messages.open.is_some());
        assert!(messages.close.is_some());
        assert!(messages.handle(MessageKind::Open).is_some());
        assert!(messages.handle(MessageKind::Write).is_none());
    }
}
