//! In-process transport.
//!
//! [`MemorySocket`] implements [`Socket`] without any network: outbound
//! frames are recorded, an optional responder scripts the server side, and
//! inbound frames are delivered to the listener in order from a dedicated
//! task, exactly as a real receive loop would. Connection loss, reconnects
//! and remote closes are triggered explicitly.
//!
//! Useful for testing an [`ApiBinding`](crate::ApiBinding) against the full
//! pool without a server.
//!
//! ```ignore
//! let factory = MemorySocketFactory::new().with_responder(|frame| {
//!     vec![format!(r#"{{"ack":{frame}}}"#)]
//! });
//! let pool = ConnectionPool::with_factory(binding, options, Arc::new(factory.clone()))?;
//! // ... subscribe ...
//! factory.sockets()[0].inject(r#"{"topic":"trades","price":1}"#);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::SocketId;
use crate::options::SocketOptions;
use crate::transport::socket::{Socket, SocketFactory, SocketListener, SocketState};
use crate::transport::throttle::ThroughputWindow;

// ============================================================================
// Types
// ============================================================================

/// Scripted server: maps each outbound frame to the frames sent back.
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

// ============================================================================
// MemorySocket
// ============================================================================

/// A [`Socket`] backed by in-process channels. Cheap to clone.
#[derive(Clone)]
pub struct MemorySocket {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    id: SocketId,
    url: RwLock<String>,
    listener: RwLock<Option<Weak<dyn SocketListener>>>,
    state: Mutex<SocketState>,
    sent: Mutex<Vec<String>>,
    responder: RwLock<Option<Responder>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    received: Mutex<ThroughputWindow>,
    fail_connect: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
    close_count: AtomicUsize,
    reconnect_count: AtomicUsize,
}

impl MemorySocket {
    /// Creates an unconnected socket.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                id: SocketId::next(),
                url: RwLock::new(url.into()),
                listener: RwLock::new(None),
                state: Mutex::new(SocketState::Idle),
                sent: Mutex::new(Vec::new()),
                responder: RwLock::new(None),
                inbound: Mutex::new(None),
                received: Mutex::new(ThroughputWindow::new()),
                fail_connect: AtomicBool::new(false),
                close_lock: tokio::sync::Mutex::new(()),
                close_count: AtomicUsize::new(0),
                reconnect_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Sets the scripted server.
    pub fn set_responder(&self, responder: Option<Responder>) {
        *self.inner.responder.write() = responder;
    }

    /// Makes subsequent connects fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Returns every frame sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().clone()
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.inner.state.lock()
    }

    /// Number of times the socket actually closed.
    #[inline]
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Number of reconnects performed.
    #[inline]
    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    /// Delivers a frame from the "server". Ignored while not connected.
    pub fn inject(&self, text: impl Into<String>) {
        let text = text.into();
        self.inner
            .received
            .lock()
            .record(Instant::now(), text.len());
        if let Some(tx) = self.inner.inbound.lock().as_ref() {
            let _ = tx.send(text);
        }
    }

    /// Simulates connection loss. Frames keep being recorded but get no responses.
    pub fn drop_connection(&self) {
        if self.state() != SocketState::Open {
            return;
        }
        self.set_state(SocketState::Reconnecting);
        if let Some(listener) = self.inner.listener() {
            listener.on_reconnecting();
        }
    }

    /// Simulates a successful reconnect after [`drop_connection`](Self::drop_connection).
    pub fn restore_connection(&self) {
        if self.state() != SocketState::Reconnecting {
            return;
        }
        self.inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
        self.set_state(SocketState::Open);
        if let Some(listener) = self.inner.listener() {
            listener.on_reconnected();
        }
    }

    /// Drops and immediately restores the connection.
    pub fn simulate_reconnect(&self) {
        self.drop_connection();
        self.restore_connection();
    }

    /// Simulates the server closing the connection for good.
    pub fn simulate_remote_close(&self) {
        self.finish_close();
    }

    fn set_state(&self, state: SocketState) {
        *self.inner.state.lock() = state;
    }

    fn finish_close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SocketState::Closed {
                return;
            }
            *state = SocketState::Closed;
        }

        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.inbound.lock().take();
        debug!(socket_id = %self.inner.id, "Memory socket closed");

        if let Some(listener) = self.inner.listener() {
            listener.on_close();
        }
    }
}

impl MemoryInner {
    fn listener(&self) -> Option<Arc<dyn SocketListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Socket for MemorySocket {
    #[inline]
    fn id(&self) -> SocketId {
        self.inner.id
    }

    fn url(&self) -> String {
        self.inner.url.read().clone()
    }

    fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    fn set_listener(&self, listener: Weak<dyn SocketListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    async fn connect(&self) -> Result<()> {
        match self.state() {
            SocketState::Closed | SocketState::Closing => return Err(Error::ConnectionClosed),
            SocketState::Open | SocketState::Reconnecting => return Ok(()),
            SocketState::Idle | SocketState::Connecting => {}
        }

        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection(format!(
                "Handshake with {} failed: connection refused",
                self.url()
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.inner.inbound.lock() = Some(tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Some(listener) = inner.listener() {
                    listener.on_message(text);
                }
            }
        });

        self.set_state(SocketState::Open);
        if let Some(listener) = self.inner.listener() {
            listener.on_open();
        }
        Ok(())
    }

    fn send(&self, data: String) -> bool {
        match self.state() {
            SocketState::Closed | SocketState::Closing => return false,
            SocketState::Open => {}
            _ => {
                self.inner.sent.lock().push(data);
                return true;
            }
        }

        let responder = self.inner.responder.read().clone();
        let replies = responder.map(|respond| respond(&data)).unwrap_or_default();
        self.inner.sent.lock().push(data);

        for reply in replies {
            self.inject(reply);
        }
        true
    }

    async fn reconnect(&self) {
        if self.is_open() {
            self.simulate_reconnect();
        }
    }

    async fn close(&self) {
        let _guard = self.inner.close_lock.lock().await;
        self.finish_close();
    }

    fn incoming_kbps(&self) -> f64 {
        self.inner.received.lock().kbps(Instant::now())
    }
}

// ============================================================================
// MemorySocketFactory
// ============================================================================

/// Creates [`MemorySocket`]s and keeps a handle to each. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemorySocketFactory {
    inner: Arc<FactoryInner>,
}

#[derive(Default)]
struct FactoryInner {
    sockets: Mutex<Vec<MemorySocket>>,
    responder: RwLock<Option<Responder>>,
    fail_connect: AtomicBool,
}

impl MemorySocketFactory {
    /// Creates a factory without a responder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the responder installed on every socket created afterwards.
    #[must_use]
    pub fn with_responder(self, responder: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) -> Self {
        *self.inner.responder.write() = Some(Arc::new(responder));
        self
    }

    /// Makes sockets created afterwards fail to connect.
    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Returns every socket created so far, oldest first.
    #[must_use]
    pub fn sockets(&self) -> Vec<MemorySocket> {
        self.inner.sockets.lock().clone()
    }
}

impl SocketFactory for MemorySocketFactory {
    fn create(&self, url: &str, _options: &SocketOptions) -> Arc<dyn Socket> {
        let socket = MemorySocket::new(url);
        socket.set_responder(self.inner.responder.read().clone());
        socket.set_fail_connect(self.inner.fail_connect.load(Ordering::SeqCst));
        self.inner.sockets.lock().push(socket.clone());
        Arc::new(socket)
    }
}

// ============================================================================
// Tests
// ============================================================================
