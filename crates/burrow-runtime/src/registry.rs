//! Peer registry: peer table, socket tables, and message dispatch
//!
//! One explicitly constructed [`PeerRegistry`] per process, owned by the
//! host and passed to whoever needs it. It is the sole owner of the peer
//! table and the two socket tables; every other component addresses sockets
//! by id only. All table access is serialized behind one mutex with short,
//! never-awaiting critical sections, so the two entries for a socket are
//! inserted and removed atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burrow_core::wire::{ConnectParams, MessageKind, WireMessage};
use burrow_core::{
    BurrowError, BurrowResult, PeerKey, SocketId, SocketIdAllocator, SocketRequest, TunnelConfig,
};
use tracing::{debug, warn};

use crate::channel::{FrameReceiver, MessageHandle, PeerChannel, PeerMessages};
use crate::socket::VirtualSocket;
use crate::stream::TunnelStream;

// ----------------------------------------------------------------------------
// Peer Entries
// ----------------------------------------------------------------------------

/// Per-peer registry entry: the message send handles bound to that peer's
/// channel
#[derive(Debug, Clone, Default)]
pub struct PeerEntity {
    pub messages: PeerMessages,
}

/// Merge-write payload for [`PeerRegistry::update`]
///
/// Filled handle slots replace the peer's current ones; empty slots leave
/// existing registrations untouched, so each message-kind registration can
/// be performed independently.
#[derive(Debug, Default)]
pub struct PeerUpdate {
    pub messages: PeerMessages,
}

impl PeerUpdate {
    /// An update carrying a full handle set
    pub fn messages(messages: PeerMessages) -> Self {
        Self { messages }
    }

    /// An update registering a single message handle
    pub fn message(handle: MessageHandle) -> Self {
        Self {
            messages: PeerMessages::only(handle),
        }
    }
}

#[derive(Default)]
struct RegistryTables {
    peers: HashMap<PeerKey, PeerEntity>,
    sockets: HashMap<SocketId, Arc<VirtualSocket>>,
    socket_map: HashMap<SocketId, SocketId>,
}

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Process-wide registry of peers and active virtual sockets
pub struct PeerRegistry {
    config: TunnelConfig,
    allocator: SocketIdAllocator,
    inner: Mutex<RegistryTables>,
}

impl PeerRegistry {
    /// Construct a registry with a validated configuration
    pub fn new(config: TunnelConfig) -> BurrowResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            allocator: SocketIdAllocator::new(),
            inner: Mutex::new(RegistryTables::default()),
        }))
    }

    /// The registry's configuration
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------

    /// Look up a peer's entry
    pub fn get(&self, peer: &PeerKey) -> Option<PeerEntity> {
        self.tables().peers.get(peer).cloned()
    }

    /// Merge an update into a peer's entry, creating it if absent
    pub fn update(&self, peer: &PeerKey, update: PeerUpdate) {
        let mut tables = self.tables();
        let entity = tables.peers.entry(*peer).or_default();
        entity.messages.merge(update.messages);
    }

    /// Register all five message handles for a freshly negotiated peer
    /// channel, one registration per kind
    pub fn handle_new_peer_channel(&self, peer: &PeerKey, channel: Arc<dyn PeerChannel>) {
        for kind in MessageKind::ALL {
            self.update(
                peer,
                PeerUpdate::message(MessageHandle::new(kind, channel.clone())),
            );
        }
        debug!(peer = %peer, "peer channel registered");
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    /// Apply one decoded message from a peer's channel
    ///
    /// Messages for an id with no table entry are tolerated silently; the
    /// socket may already be destroyed, and "already closed" is deliberately
    /// indistinguishable from "never existed".
    pub async fn handle_message(self: &Arc<Self>, peer: &PeerKey, message: WireMessage) {
        match message {
            WireMessage::Open {
                request,
                params: Some(params),
            } => self.accept_open(peer, request, params),
            WireMessage::Open {
                request,
                params: None,
            } => match self.lookup(request.remote_id) {
                Some(socket) => socket.handle_open_ack(request.id),
                None => debug!(peer = %peer, request = %request, "open ack for unknown socket"),
            },
            WireMessage::Write { request, data } => match self.lookup(request.remote_id) {
                Some(socket) => socket.write(data).await,
                None => debug!(peer = %peer, request = %request, "write for unknown socket"),
            },
            WireMessage::Close { request } => match self.lookup(request.remote_id) {
                Some(socket) => socket.destroy().await,
                None => debug!(peer = %peer, request = %request, "close for unknown socket"),
            },
            WireMessage::Timeout { request } => match self.lookup(request.remote_id) {
                Some(socket) => socket.handle_remote_timeout(),
                None => debug!(peer = %peer, request = %request, "timeout for unknown socket"),
            },
            WireMessage::Error { request, error } => {
                // Informational only; the remote socket's teardown is driven
                // by its own close signals.
                debug!(peer = %peer, request = %request, error = %error, "remote socket error");
            }
        }
    }

    /// Inbound open request: allocate a local id, register the socket, and
    /// dial in the background
    fn accept_open(self: &Arc<Self>, peer: &PeerKey, request: SocketRequest, params: ConnectParams) {
        let Some(entity) = self.get(peer) else {
            warn!(peer = %peer, "open request from unregistered peer");
            return;
        };

        let local_id = self.allocator.next_id();
        let socket =
            VirtualSocket::create(local_id, request.id, *peer, entity.messages, self, params);
        debug!(peer = %peer, socket = %local_id, remote = %request.id, "accepting open request");

        tokio::spawn(async move {
            if let Err(err) = socket.connect().await {
                debug!(socket = %socket.id(), error = %err, "connect failed");
            }
        });
    }

    /// Decode and dispatch every frame a peer channel delivers; when the
    /// channel ends, tear the peer down
    pub async fn drive_channel(self: Arc<Self>, peer: PeerKey, mut frames: FrameReceiver) {
        while let Some(frame) = frames.recv().await {
            match WireMessage::decode(&frame) {
                Ok(message) => self.handle_message(&peer, message).await,
                Err(err) => warn!(peer = %peer, error = %err, "undecodable frame dropped"),
            }
        }
        self.handle_close_peer(&peer).await;
    }

    // ------------------------------------------------------------------
    // Locally-initiated tunnels
    // ------------------------------------------------------------------

    /// Open a tunneled connection through a registered peer and return the
    /// local byte-stream handle
    pub async fn open_socket(
        self: &Arc<Self>,
        peer: &PeerKey,
        params: ConnectParams,
    ) -> BurrowResult<TunnelStream> {
        let entity = self
            .get(peer)
            .ok_or_else(|| BurrowError::peer_not_registered(peer.to_string()))?;

        let local_id = self.allocator.next_id();
        let (socket, data_rx) =
            VirtualSocket::create_local(local_id, *peer, entity.messages, self);

        if let Err(err) = socket.send_open_request(params).await {
            socket.destroy().await;
            return Err(err);
        }
        debug!(peer = %peer, socket = %local_id, "open request sent");

        Ok(TunnelStream::new(socket, data_rx))
    }

    // ------------------------------------------------------------------
    // Peer teardown
    // ------------------------------------------------------------------

    /// Destroy every virtual socket owned by a peer, then evict the peer
    ///
    /// No virtual socket outlives its controlling peer connection. A failure
    /// tearing one socket down never affects the others.
    pub async fn handle_close_peer(&self, peer: &PeerKey) {
        let owned: Vec<Arc<VirtualSocket>> = {
            self.tables()
                .sockets
                .values()
                .filter(|socket| socket.peer() == peer)
                .cloned()
                .collect()
        };

        for socket in owned {
            socket.destroy().await;
        }

        self.tables().peers.remove(peer);
        debug!(peer = %peer, "peer closed");
    }

    // ------------------------------------------------------------------
    // Socket tables
    // ------------------------------------------------------------------

    /// Insert both table entries for a socket in one critical section
    pub(crate) fn insert_socket(&self, socket: Arc<VirtualSocket>) {
        let mut tables = self.tables();
        tables
            .socket_map
            .insert(socket.id(), socket.remote_socket_id());
        tables.sockets.insert(socket.id(), socket);
    }

    /// Remove both table entries for a socket in one critical section
    pub(crate) fn remove_socket(&self, id: SocketId) {
        let mut tables = self.tables();
        tables.sockets.remove(&id);
        tables.socket_map.remove(&id);
    }

    /// Record the remote identifier learned from an open acknowledgment
    pub(crate) fn set_remote_id(&self, id: SocketId, remote: SocketId) {
        if let Some(entry) = self.tables().socket_map.get_mut(&id) {
            *entry = remote;
        }
    }

    fn lookup(&self, id: SocketId) -> Option<Arc<VirtualSocket>> {
        self.tables().sockets.get(&id).cloned()
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Whether a local id currently has a socket-table entry
    pub fn contains_socket(&self, id: SocketId) -> bool {
        self.tables().sockets.contains_key(&id)
    }

    /// The remote identifier mapped for a local id, if registered
    pub fn remote_id_of(&self, id: SocketId) -> Option<SocketId> {
        self.tables().socket_map.get(&id).copied()
    }

    /// Number of active virtual sockets
    pub fn socket_count(&self) -> usize {
        self.tables().sockets.len()
    }

    /// Number of active virtual sockets owned by one peer
    pub fn peer_socket_count(&self, peer: &PeerKey) -> usize {
        self.tables()
            .sockets
            .values()
            .filter(|socket| socket.peer() == peer)
            .count()
    }

    fn tables(&self) -> MutexGuard<'_, RegistryTables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tables = self.tables();
        f.debug_struct("PeerRegistry")
            .field("peers", &tables.peers.len())
            .field("sockets", &tables.sockets.len())
            .finish_non_exhaustive()
    }
}
