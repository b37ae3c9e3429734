//! Typed broadcast hub for SSE connections.

use std::{collections::HashMap, sync::Arc, thread};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    sse::connection::SseConnection,
};

/// Buffered capacity of the broadcast channel.
const BROADCAST_BUFFER: usize = 256;
/// Buffered capacity of the register/unregister channels.
const MEMBERSHIP_BUFFER: usize = 16;

/// Conversion of a broadcast payload to the bytes of a `data:` field.
///
/// Textual payloads pass through unchanged; everything else goes through
/// a string projection ([`Text`] for any `Display` type) or JSON
/// ([`Json`] for any `Serialize` type). An error drops that broadcast
/// without disturbing the hub.
pub trait EventData: Send + 'static {
    /// Produce the event data for this payload.
    fn to_event_data(&self) -> Result<String>;
}

impl EventData for String {
    fn to_event_data(&self) -> Result<String> {
        Ok(self.clone())
    }
}

impl EventData for &'static str {
    fn to_event_data(&self) -> Result<String> {
        Ok((*self).to_owned())
    }
}

impl EventData for Arc<str> {
    fn to_event_data(&self) -> Result<String> {
        Ok(self.as_ref().to_owned())
    }
}

/// Wrapper broadcasting any `Display` value through its string
/// projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text<T>(pub T);

impl<T: std::fmt::Display + Send + 'static> EventData for Text<T> {
    fn to_event_data(&self) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Wrapper broadcasting any `Serialize` value as its JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + 'static> EventData for Json<T> {
    fn to_event_data(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Running,
    Stopped,
}

/// A broadcast hub over SSE connections, generic in the payload type.
///
/// The same supervisor shape as the WebSocket [`Hub`](crate::hub::Hub):
/// one dispatch loop owns the membership, three channels feed it, close is
/// idempotent and disconnects every member. Unlike the WebSocket hub, the
/// surface methods report [`Error::HubClosed`] once the hub is shut down.
pub struct SseHub<T: EventData> {
    inner: Arc<SseHubInner<T>>,
}

impl<T: EventData> Clone for SseHub<T> {
    fn clone(&self) -> Self {
        SseHub { inner: Arc::clone(&self.inner) }
    }
}

struct SseHubInner<T> {
    clients: Mutex<HashMap<usize, SseConnection>>,

    register_tx: Sender<SseConnection>,
    register_rx: Receiver<SseConnection>,
    unregister_tx: Sender<SseConnection>,
    unregister_rx: Receiver<SseConnection>,
    broadcast_tx: Sender<T>,
    broadcast_rx: Receiver<T>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,

    closed: RwLock<bool>,
    state: Mutex<DispatchState>,
    state_changed: Condvar,
}

impl<T: EventData> std::fmt::Debug for SseHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseHub")
            .field("clients", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: EventData> Default for SseHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: EventData> SseHub<T> {
    /// Create a hub. Start the dispatch loop with [`SseHub::start`] or
    /// [`SseHub::run`].
    pub fn new() -> SseHub<T> {
        let (register_tx, register_rx) = bounded(MEMBERSHIP_BUFFER);
        let (unregister_tx, unregister_rx) = bounded(MEMBERSHIP_BUFFER);
        let (broadcast_tx, broadcast_rx) = bounded(BROADCAST_BUFFER);
        let (done_tx, done_rx) = bounded(1);

        SseHub {
            inner: Arc::new(SseHubInner {
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

    /// Run the dispatch loop on the current thread until the hub closes.
    /// At most one loop runs; later calls return immediately.
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
                    if let Ok(payload) = msg {
                        self.handle_broadcast(payload);
                    }
                }
                recv(self.inner.done_rx) -> _ => break,
            }
        }

        let mut state = self.inner.state.lock();
        *state = DispatchState::Stopped;
        self.inner.state_changed.notify_all();
    }

    /// Add a connection to the membership.
    pub fn register(&self, connection: SseConnection) -> Result<()> {
        if self.is_closed() {
            return Err(Error::HubClosed);
        }
        let _ = self.inner.register_tx.send(connection);
        Ok(())
    }

    /// Remove a connection and close it. A no-op for unknown peers.
    pub fn unregister(&self, connection: &SseConnection) -> Result<()> {
        if self.is_closed() {
            return Err(Error::HubClosed);
        }
        let _ = self.inner.unregister_tx.send(connection.clone());
        Ok(())
    }

    /// Queue a payload for delivery to every registered connection. A peer
    /// whose send fails is removed and closed; an encoding failure drops
    /// the payload entirely.
    pub fn broadcast(&self, payload: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::HubClosed);
        }
        let _ = self.inner.broadcast_tx.send(payload);
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

    /// Shut the hub down: stop and wait for the dispatch loop, close every
    /// member, drain the channels. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let _ = self.inner.done_tx.try_send(());

        let mut state = self.inner.state.lock();
        while *state == DispatchState::Running {
            self.inner.state_changed.wait(&mut state);
        }
        drop(state);

        let clients: Vec<SseConnection> =
            self.inner.clients.lock().drain().map(|(_, conn)| conn).collect();
        for connection in clients {
            let _ = connection.close();
        }

        while self.inner.register_rx.try_recv().is_ok() {}
        while self.inner.unregister_rx.try_recv().is_ok() {}
        while self.inner.broadcast_rx.try_recv().is_ok() {}

        Ok(())
    }

    fn handle_register(&self, connection: SseConnection) {
        let mut clients = self.inner.clients.lock();
        clients.insert(connection.key(), connection);
        debug!(clients = clients.len(), "sse peer registered");
    }

    fn handle_unregister(&self, connection: &SseConnection) {
        let removed = self.inner.clients.lock().remove(&connection.key());
        if let Some(connection) = removed {
            let _ = connection.close();
            debug!("sse peer unregistered");
        }
    }

    /// Encode once, then deliver to a snapshot of the membership. Each
    /// send is a short buffered write, so delivery is sequential; failing
    /// peers are removed on the spot.
    fn handle_broadcast(&self, payload: T) {
        let clients: Vec<SseConnection> =
            self.inner.clients.lock().values().cloned().collect();

        let data = match payload.to_event_data() {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, "dropping broadcast: payload encoding failed");
                return;
            }
        };

        debug!(recipients = clients.len(), "sse broadcast");
        for connection in clients {
            if connection.send_data(&data).is_err() {
                warn!("evicting sse peer after failed send");
                if self.inner.clients.lock().remove(&connection.key()).is_some() {
                    let _ = connection.close();
                }
            }
        }
    }
}

impl SseHub<String> {
    /// Serialize a value to JSON and broadcast the resulting string.
    pub fn broadcast_json<V: Serialize>(&self, value: &V) -> Result<()> {
        self.broadcast(serde_json::to_string(value)?)
    }
}
