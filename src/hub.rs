//! Broadcast hub: fans one message out to every registered WebSocket
//! connection and evicts peers whose writes fail or who fall too far
//! behind.

use std::{collections::HashMap, sync::Arc, thread};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::Result,
    protocol::{connection::Connection, message::Message, utf8::Utf8Bytes},
};

/// Buffered capacity of the broadcast channel, smoothing bursts.
const BROADCAST_BUFFER: usize = 256;
/// Buffered capacity of the register/unregister channels.
const MEMBERSHIP_BUFFER: usize = 16;
/// Outbound queue depth per peer. A full queue drops messages for that
/// peer instead of stalling the rest.
const PEER_QUEUE_BUFFER: usize = 64;
/// Dropped-message budget before a slow peer is evicted outright.
const SLOW_PEER_DROP_LIMIT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Running,
    Stopped,
}

/// A registered peer: its connection, the send side of its outbound
/// queue, and how many broadcasts it has dropped on the floor.
struct Peer {
    connection: Arc<Connection>,
    queue: Sender<Message>,
    drops: u32,
}

/// A supervisor owning a membership set of connections.
///
/// One dispatch task ([`Hub::run`]) owns the membership; registration,
/// unregistration and broadcasts all flow to it through channels, so the
/// surface methods are safe under concurrent callers and return without
/// waiting for delivery. Each peer has its own outbound queue drained by a
/// dedicated emitter thread: a slow peer delays nobody, and every peer
/// observes broadcasts in enqueue order. Once [`Hub::close`] has run,
/// surface calls are silently dropped.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use surge::{accept, hub::Hub};
/// # fn demo(listener: std::net::TcpListener) -> surge::Result<()> {
/// let hub = Hub::new();
/// hub.start();
///
/// for stream in listener.incoming() {
///     let (connection, _protocol) = accept(stream?)?;
///     let connection = Arc::new(connection);
///     hub.register(Arc::clone(&connection));
///
///     let hub = hub.clone();
///     std::thread::spawn(move || {
///         while let Ok(message) = connection.read() {
///             hub.broadcast(message);
///         }
///         hub.unregister(&connection);
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// Membership, keyed by connection identity. Mutated only by the
    /// dispatch loop and by close.
    clients: Mutex<HashMap<usize, Peer>>,

    register_tx: Sender<Arc<Connection>>,
    register_rx: Receiver<Arc<Connection>>,
    unregister_tx: Sender<Arc<Connection>>,
    unregister_rx: Receiver<Arc<Connection>>,
    broadcast_tx: Sender<Message>,
    broadcast_rx: Receiver<Message>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,

    closed: RwLock<bool>,
    state: Mutex<DispatchState>,
    state_changed: Condvar,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Create a hub. The dispatch loop must be started with [`Hub::start`]
    /// (or by calling [`Hub::run`] on a dedicated thread) before messages
    /// flow.
    pub fn new() -> Hub {
        let (register_tx, register_rx) = bounded(MEMBERSHIP_BUFFER);
        let (unregister_tx, unregister_rx) = bounded(MEMBERSHIP_BUFFER);
        let (broadcast_tx, broadcast_rx) = bounded(BROADCAST_BUFFER);
        let (done_tx, done_rx) = bounded(1);

        Hub {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                register_tx,
                register_rx,
                unregister_tx,
                unregister_rx,
                broadcast_tx,
                broadcast_rx,
                done_tx,
                done_rx,
                closed: RwLock::new(false),
                state: Mutex::new(DispatchState::Idle),
                state_changed: Condvar::new(),
            }),
        }
    }

    /// Spawn the dispatch loop on its own thread.
    pub fn start(&self) -> thread::JoinHandle<()> {
        let hub = self.clone();
        thread::spawn(move || hub.run())
    }

    /// Run the dispatch loop on the current thread until the hub is
    /// closed. At most one loop runs; later calls return immediately.
    pub fn run(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != DispatchState::Idle {
                return;
            }
            *state = DispatchState::Running;
        }

        loop {
            select! {
                recv(self.inner.register_rx) -> msg => {
                    if let Ok(connection) = msg {
                        self.handle_register(connection);
                    }
                }
                recv(self.inner.unregister_rx) -> msg => {
                    if let Ok(connection) = msg {
                        self.handle_unregister(&connection);
                    }
                }
                recv(self.inner.broadcast_rx) -> msg => {
                    if let Ok(message) = msg {
                        self.handle_broadcast(message);
                    }
                }
                recv(self.inner.done_rx) -> _ => break,
            }
        }

        let mut state = self.inner.state.lock();
        *state = DispatchState::Stopped;
        self.inner.state_changed.notify_all();
    }

    /// Add a connection to the membership. Dropped silently once the hub
    /// is closed.
    pub fn register(&self, connection: Arc<Connection>) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.register_tx.send(connection);
    }

    /// Remove a connection and close it. A no-op for unknown peers and on
    /// a closed hub.
    pub fn unregister(&self, connection: &Arc<Connection>) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.unregister_tx.send(Arc::clone(connection));
    }

    /// Queue a message for delivery to every registered connection.
    ///
    /// Delivery happens asynchronously; a peer whose write fails is
    /// unregistered without affecting the others. Dropped silently once
    /// the hub is closed.
    pub fn broadcast(&self, message: impl Into<Message>) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.broadcast_tx.send(message.into());
    }

    /// Broadcast a text message.
    pub fn broadcast_text(&self, text: impl Into<Utf8Bytes>) {
        self.broadcast(Message::Text(text.into()));
    }

    /// Serialize a value to JSON and broadcast it as a text message.
    /// Fails only when serialization does.
    pub fn broadcast_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.broadcast(Message::text(json));
        Ok(())
    }

    /// Number of currently registered connections.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Whether the hub has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    /// Shut the hub down: stop the dispatch loop, wait for it, close every
    /// registered connection and drain the channels. Safe to call more
    /// than once.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return;
            }
            *closed = true;
        }

        let _ = self.inner.done_tx.try_send(());

        let mut state = self.inner.state.lock();
        while *state == DispatchState::Running {
            self.inner.state_changed.wait(&mut state);
        }
        drop(state);

        let peers: Vec<Peer> =
            self.inner.clients.lock().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            // Dropping the queue sender stops the emitter thread.
            let _ = peer.connection.close();
        }

        while self.inner.register_rx.try_recv().is_ok() {}
        while self.inner.unregister_rx.try_recv().is_ok() {}
        while self.inner.broadcast_rx.try_recv().is_ok() {}
    }

    /// Insert a peer and spawn its emitter: a thread draining the peer's
    /// queue into its connection, in order, until the queue closes or a
    /// write fails.
    fn handle_register(&self, connection: Arc<Connection>) {
        let (queue_tx, queue_rx) = bounded::<Message>(PEER_QUEUE_BUFFER);

        let emitter_conn = Arc::clone(&connection);
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            while let Ok(message) = queue_rx.recv() {
                if emitter_conn.write(message).is_err() {
                    warn!("evicting peer after failed broadcast write");
                    if !*inner.closed.read() {
                        let _ = inner.unregister_tx.try_send(emitter_conn);
                    }
                    return;
                }
            }
        });

        let mut clients = self.inner.clients.lock();
        clients.insert(
            key(&connection),
            Peer { connection, queue: queue_tx, drops: 0 },
        );
        debug!(clients = clients.len(), "peer registered");
    }

    fn handle_unregister(&self, connection: &Arc<Connection>) {
        let removed = self.inner.clients.lock().remove(&key(connection));
        if let Some(peer) = removed {
            let _ = peer.connection.close();
            debug!("peer unregistered");
        }
    }

    /// Enqueue the message onto every peer's queue. A full queue drops the
    /// message for that peer; a peer that keeps dropping, or whose emitter
    /// has died, is evicted.
    fn handle_broadcast(&self, message: Message) {
        let mut clients = self.inner.clients.lock();
        debug!(recipients = clients.len(), "broadcast");

        let mut evict = Vec::new();
        for (id, peer) in clients.iter_mut() {
            match peer.queue.try_send(message.clone()) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    peer.drops += 1;
                    if peer.drops >= SLOW_PEER_DROP_LIMIT {
                        warn!(drops = peer.drops, "evicting slow peer");
                        evict.push(*id);
                    } else {
                        warn!(drops = peer.drops, "dropping broadcast for slow peer");
                    }
                }
                Err(TrySendError::Disconnected(_)) => evict.push(*id),
            }
        }

        for id in evict {
            if let Some(peer) = clients.remove(&id) {
                let _ = peer.connection.close();
            }
        }
    }
}

/// Identity key for membership: the pointer behind the `Arc`.
fn key(connection: &Arc<Connection>) -> usize {
    Arc::as_ptr(connection) as usize
}
