//! Virtual sockets: one tunneled TCP connection each
//!
//! A virtual socket bridges one OS-level TCP connection to the wire messages
//! of its owning peer. Local socket events become outbound messages tagged
//! with the socket's id-pair; inbound messages are applied to the OS socket
//! by the registry's dispatch. Destruction is idempotent and is the only
//! thing that removes the socket from the registry tables.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use burrow_core::wire::{ConnectParams, WireError, WireMessage};
use burrow_core::{BurrowResult, PeerKey, SocketError, SocketId, SocketRequest, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::channel::PeerMessages;
use crate::registry::PeerRegistry;

// ----------------------------------------------------------------------------
// Socket State
// ----------------------------------------------------------------------------

/// Lifecycle state of a virtual socket
///
/// `Errored` does not transition to `Closed` by itself; an explicit
/// close/end signal is required, so the remote peer can observe the error
/// before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Connecting,
    Open,
    Errored,
    Closed,
}

impl core::fmt::Display for SocketState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SocketState::Created => write!(f, "Created"),
            SocketState::Connecting => write!(f, "Connecting"),
            SocketState::Open => write!(f, "Open"),
            SocketState::Errored => write!(f, "Errored"),
            SocketState::Closed => write!(f, "Closed"),
        }
    }
}

// ----------------------------------------------------------------------------
// Virtual Socket
// ----------------------------------------------------------------------------

/// One tunneled TCP connection bound to an owning peer
pub struct VirtualSocket {
    id: SocketId,
    remote_id: AtomicU32,
    peer: PeerKey,
    messages: PeerMessages,
    registry: Weak<PeerRegistry>,
    config: TunnelConfig,
    params: Option<ConnectParams>,
    state: Mutex<SocketState>,
    /// Inbound payload queue; bounded, so a flooding peer suspends the
    /// dispatcher instead of dropping bytes
    data_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Receiver half of the payload queue, parked until `connect` hands it
    /// to the writer task
    pending_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    destroyed: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Flips once the tunnel is established (OS connection up, or the
    /// remote's acknowledgment received); outbound data waits on it so no
    /// Write message ever precedes the open handshake
    established: watch::Sender<bool>,
}

impl VirtualSocket {
    /// Construct a socket for an inbound open request and register it into
    /// the registry tables immediately, before any connection attempt
    pub fn create(
        id: SocketId,
        remote_id: SocketId,
        peer: PeerKey,
        messages: PeerMessages,
        registry: &Arc<PeerRegistry>,
        params: ConnectParams,
    ) -> Arc<Self> {
        let (socket, data_rx) = Self::build(id, remote_id, peer, messages, registry, Some(params));
        *lock(&socket.pending_rx) = Some(data_rx);
        registry.insert_socket(socket.clone());
        socket
    }

    /// Construct a socket for a locally-initiated open request; the returned
    /// receiver is the read side of a tunnel stream
    pub(crate) fn create_local(
        id: SocketId,
        peer: PeerKey,
        messages: PeerMessages,
        registry: &Arc<PeerRegistry>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (socket, data_rx) = Self::build(id, SocketId::UNASSIGNED, peer, messages, registry, None);
        registry.insert_socket(socket.clone());
        (socket, data_rx)
    }

    fn build(
        id: SocketId,
        remote_id: SocketId,
        peer: PeerKey,
        messages: PeerMessages,
        registry: &Arc<PeerRegistry>,
        params: Option<ConnectParams>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let config = registry.config().clone();
        let (data_tx, data_rx) = mpsc::channel(config.write_queue_depth);
        let (shutdown, _) = watch::channel(false);
        let (established, _) = watch::channel(false);

        let socket = Arc::new(Self {
            id,
            remote_id: AtomicU32::new(remote_id.value()),
            peer,
            messages,
            registry: Arc::downgrade(registry),
            config,
            params,
            state: Mutex::new(SocketState::Created),
            data_tx: Mutex::new(Some(data_tx)),
            pending_rx: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            shutdown,
            established,
        });
        (socket, data_rx)
    }

    /// Local identifier
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Remote identifier as currently known
    pub fn remote_socket_id(&self) -> SocketId {
        SocketId::new(self.remote_id.load(Ordering::SeqCst))
    }

    /// Owning peer
    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    /// Current lifecycle state
    pub fn state(&self) -> SocketState {
        *lock(&self.state)
    }

    /// The addressing pair stamped on every outbound message
    pub fn request(&self) -> SocketRequest {
        SocketRequest::new(self.id, self.remote_socket_id())
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Validate the destination port and open the OS-level connection
    ///
    /// A disallowed port emits one Error message and leaves the socket
    /// `Errored` without ever touching the OS. On success the socket sends
    /// one Open acknowledgment and starts its reader/writer tasks.
    pub async fn connect(self: &Arc<Self>) -> BurrowResult<()> {
        let params = self
            .params
            .clone()
            .ok_or(SocketError::MissingConnectParams)?;

        self.set_state(SocketState::Connecting);

        if !self.config.is_port_allowed(params.port) {
            self.set_state(SocketState::Errored);
            self.send_error(WireError::port_not_allowed(params.port)).await;
            return Err(burrow_core::BurrowError::port_not_allowed(params.port));
        }

        let dial = TcpStream::connect((params.host.as_str(), params.port));
        let stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Err(_) => {
                self.set_state(SocketState::Errored);
                self.send_timeout().await;
                return Err(SocketError::ConnectTimeout {
                    duration_ms: self.config.connect_timeout.as_millis() as u64,
                }
                .into());
            }
            Ok(Err(err)) => {
                self.set_state(SocketState::Errored);
                self.send_error(WireError::from(&err)).await;
                return Err(SocketError::Io(err).into());
            }
            Ok(Ok(stream)) => stream,
        };

        self.set_state(SocketState::Open);
        let _ = self.established.send(true);
        self.send_open_ack().await;

        let Some(data_rx) = lock(&self.pending_rx).take() else {
            debug!(socket = %self.id, "connect called twice");
            return Ok(());
        };

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(self.clone().run_reader(read_half));
        tokio::spawn(self.clone().run_writer(write_half, data_rx));

        Ok(())
    }

    /// Drain the OS socket into outbound Write messages, relaying idle
    /// timeouts, until EOF, error, or destroy
    async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.read_chunk_size];
        loop {
            let read = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                read = tokio::time::timeout(self.config.idle_timeout, read_half.read(&mut buf)) => read,
            };
            match read {
                Err(_) => {
                    // Idle; relay and keep the connection up. Ending the
                    // tunnel on idleness is the remote peer's decision.
                    self.send_timeout().await;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if self.send_data(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    self.set_state(SocketState::Errored);
                    self.send_error(WireError::from(&err)).await;
                    break;
                }
            }
        }
        // The OS stream is finished one way or another; that is the close
        // signal that drives teardown.
        self.destroy().await;
    }

    /// Apply queued inbound payloads to the OS socket, in arrival order
    async fn run_writer(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                chunk = data_rx.recv() => chunk,
            };
            match chunk {
                None => break,
                Some(bytes) => {
                    if let Err(err) = write_half.write_all(&bytes).await {
                        self.set_state(SocketState::Errored);
                        self.send_error(WireError::from(&err)).await;
                        break;
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Inbound events (registry dispatch)
    // ------------------------------------------------------------------

    /// Inbound Write payload: enqueue toward the OS socket. A full queue
    /// suspends the caller; a closed queue means teardown already started
    /// and the bytes are moot.
    pub async fn write(&self, data: Vec<u8>) {
        let sender = lock(&self.data_tx).clone();
        match sender {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    debug!(socket = %self.id, "write for closing socket dropped");
                }
            }
            None => debug!(socket = %self.id, "write for closed socket dropped"),
        }
    }

    /// Establishment acknowledgment from the remote side; locally-initiated
    /// sockets learn their remote identifier here
    pub(crate) fn handle_open_ack(&self, remote: SocketId) {
        if remote.is_assigned()
            && self
                .remote_id
                .compare_exchange(
                    SocketId::UNASSIGNED.value(),
                    remote.value(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            if let Some(registry) = self.registry.upgrade() {
                registry.set_remote_id(self.id, remote);
            }
        }
        self.set_state(SocketState::Open);
        let _ = self.established.send(true);
        debug!(socket = %self.id, remote = %self.remote_socket_id(), "tunnel established");
    }

    /// Remote-side idle notification; informational only
    pub(crate) fn handle_remote_timeout(&self) {
        debug!(socket = %self.id, "remote reported idle timeout");
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove this socket from both registry tables and send one Close
    ///
    /// Idempotent: only the first call removes entries and emits the Close;
    /// later calls are no-ops.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_socket(self.id);
        }
        self.set_state(SocketState::Closed);
        let _ = self.shutdown.send(true);
        // Dropping the queue sender lets a pending tunnel-stream read see EOF.
        lock(&self.data_tx).take();

        let request = self.request();
        if let Some(handle) = &self.messages.close {
            if let Err(err) = handle.send(&WireMessage::Close { request }).await {
                debug!(socket = %self.id, error = %err, "close message not delivered");
            }
        }
        debug!(socket = %self.id, peer = %self.peer, "socket destroyed");
    }

    // ------------------------------------------------------------------
    // Outbound messages
    // ------------------------------------------------------------------

    /// Package locally received bytes into one outbound Write message
    ///
    /// Waits for the tunnel to establish first: the remote peer cannot route
    /// data for a socket it has not paired yet.
    pub(crate) async fn send_data(&self, data: Vec<u8>) -> BurrowResult<()> {
        self.wait_established().await?;
        let request = self.request();
        match &self.messages.write {
            Some(handle) => handle.send(&WireMessage::Write { request, data }).await,
            None => Err(burrow_core::BurrowError::channel_closed()),
        }
    }

    async fn wait_established(&self) -> BurrowResult<()> {
        if *self.established.borrow() {
            return Ok(());
        }
        let mut established = self.established.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = established.wait_for(|ok| *ok) => Ok(()),
            _ = shutdown.wait_for(|stop| *stop) => Err(burrow_core::BurrowError::channel_closed()),
        }
    }

    /// Announce the locally-initiated open request to the remote peer
    pub(crate) async fn send_open_request(&self, params: ConnectParams) -> BurrowResult<()> {
        let message = WireMessage::Open {
            request: self.request(),
            params: Some(params),
        };
        let result = match &self.messages.open {
            Some(handle) => handle.send(&message).await,
            None => Err(burrow_core::BurrowError::channel_closed()),
        };
        if result.is_ok() {
            self.set_state(SocketState::Connecting);
        }
        result
    }

    async fn send_open_ack(&self) {
        let message = WireMessage::Open {
            request: self.request(),
            params: None,
        };
        if let Some(handle) = &self.messages.open {
            if let Err(err) = handle.send(&message).await {
                debug!(socket = %self.id, error = %err, "open ack not delivered");
            }
        }
    }

    async fn send_timeout(&self) {
        let message = WireMessage::Timeout {
            request: self.request(),
        };
        if let Some(handle) = &self.messages.timeout {
            if let Err(err) = handle.send(&message).await {
                debug!(socket = %self.id, error = %err, "timeout message not delivered");
            }
        }
    }

    async fn send_error(&self, error: WireError) {
        debug!(socket = %self.id, error = %error, "socket error");
        let message = WireMessage::Error {
            request: self.request(),
            error,
        };
        if let Some(handle) = &self.messages.error {
            if let Err(err) = handle.send(&message).await {
                debug!(socket = %self.id, error = %err, "error message not delivered");
            }
        }
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    fn set_state(&self, next: SocketState) {
        let mut state = lock(&self.state);
        let allowed = match (*state, next) {
            (SocketState::Closed, _) => false,
            (SocketState::Errored, SocketState::Closed) => true,
            (SocketState::Errored, _) => false,
            _ => true,
        };
        if allowed && *state != next {
            debug!(socket = %self.id, from = %*state, to = %next, "socket state");
            *state = next;
        }
    }
}

impl core::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("id", &self.id)
            .field("remote_id", &self.remote_socket_id())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
