//! WebSocket transport backed by tokio-tungstenite.
//!
//! Each [`WebSocket`] owns one processing task. A processing cycle runs the
//! send, receive and idle loops concurrently against a single stream; the
//! first loop to fail cancels the cycle, after which the task either
//! reconnects or closes for good.
//!
//! # Processing Task
//!
//! ```text
//! ┌──────────────────────── process ────────────────────────┐
//! │  ┌───────────┐   ┌──────────────┐   ┌───────────┐        │
//! │  │ send loop │   │ receive loop │   │ idle loop │ cycle  │
//! │  └─────┬─────┘   └──────┬───────┘   └─────┬─────┘ token  │
//! │        └─────── any exit cancels ─────────┘              │
//! │                        │                                 │
//! │       stopped or no auto-reconnect? ── yes ──► on_close  │
//! │                        │ no                              │
//! │  on_reconnecting ► reconnect loop ► on_reconnected ► ↺   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Fragmented messages are reassembled by tungstenite before they reach the
//! receive loop, so every delivered message is complete.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SocketId;
use crate::options::SocketOptions;
use crate::transport::socket::{Socket, SocketFactory, SocketListener, SocketState};
use crate::transport::throttle::{SendThrottle, ThroughputWindow};

// ============================================================================
// Constants
// ============================================================================

/// Poll interval while waiting for a send slot.
const THROTTLE_POLL: Duration = Duration::from_millis(10);

/// Time allowed for the closing handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocket
// ============================================================================

/// A self-healing WebSocket client connection.
///
/// Dropping the last handle stops the processing task.
pub struct WebSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: SocketId,
    url: RwLock<String>,
    options: SocketOptions,
    listener: RwLock<Option<Weak<dyn SocketListener>>>,
    state: Mutex<SocketState>,

    /// Stream produced by a connect, consumed by the next cycle.
    pending_stream: Mutex<Option<WsStream>>,
    /// Token of the current (or next) processing cycle.
    cycle: Mutex<CancellationToken>,
    /// Cancelled once, on close.
    stop: CancellationToken,

    send_queue: Mutex<VecDeque<String>>,
    send_signal: Notify,
    throttle: Mutex<SendThrottle>,

    last_activity: Mutex<Instant>,
    last_reconnect: Mutex<Option<Instant>>,
    received: Mutex<ThroughputWindow>,

    process: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    close_lock: tokio::sync::Mutex<()>,
    close_fired: AtomicBool,
}

// ============================================================================
// WebSocket - Constructor
// ============================================================================

impl WebSocket {
    /// Creates an unconnected socket for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, options: SocketOptions) -> Self {
        let stop = CancellationToken::new();
        let inner = SocketInner {
            id: SocketId::next(),
            url: RwLock::new(url.into()),
            options,
            listener: RwLock::new(None),
            state: Mutex::new(SocketState::Idle),
            pending_stream: Mutex::new(None),
            cycle: Mutex::new(stop.child_token()),
            stop,
            send_queue: Mutex::new(VecDeque::new()),
            send_signal: Notify::new(),
            throttle: Mutex::new(SendThrottle::new()),
            last_activity: Mutex::new(Instant::now()),
            last_reconnect: Mutex::new(None),
            received: Mutex::new(ThroughputWindow::new()),
            process: tokio::sync::Mutex::new(None),
            close_lock: tokio::sync::Mutex::new(()),
            close_fired: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.inner.state()
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

// ============================================================================
// WebSocket - Socket
// ============================================================================

#[async_trait]
impl Socket for WebSocket {
    #[inline]
    fn id(&self) -> SocketId {
        self.inner.id
    }

    fn url(&self) -> String {
        self.inner.url.read().clone()
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.inner.state() == SocketState::Open
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.inner.state() == SocketState::Closed
    }

    fn set_listener(&self, listener: Weak<dyn SocketListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;

        if inner.stop.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        if matches!(
            inner.state(),
            SocketState::Open | SocketState::Reconnecting | SocketState::Connecting
        ) {
            return Ok(());
        }

        inner.set_state(SocketState::Connecting);
        let stream = match inner.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                inner.set_state(SocketState::Idle);
                return Err(e);
            }
        };

        inner.install_stream(stream);
        inner.set_state(SocketState::Open);
        if let Some(listener) = inner.listener() {
            listener.on_open();
        }

        let handle = tokio::spawn(Arc::clone(inner).process());
        *inner.process.lock().await = Some(handle);
        Ok(())
    }

    fn send(&self, data: String) -> bool {
        if self.inner.stop.is_cancelled() {
            return false;
        }

        trace!(socket_id = %self.inner.id, len = data.len(), "Frame queued");
        self.inner.send_queue.lock().push_back(data);
        self.inner.send_signal.notify_one();
        true
    }

    async fn reconnect(&self) {
        if self.inner.state() != SocketState::Open {
            debug!(socket_id = %self.inner.id, "Reconnect ignored, socket not processing");
            return;
        }

        info!(socket_id = %self.inner.id, "Reconnect requested");
        self.inner.cycle.lock().cancel();
    }

    async fn close(&self) {
        let inner = &self.inner;
        let _guard = inner.close_lock.lock().await;

        if inner.state() == SocketState::Closed {
            return;
        }

        debug!(socket_id = %inner.id, "Closing socket");
        inner.set_state(SocketState::Closing);
        inner.stop.cancel();

        let handle = inner.process.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(socket_id = %inner.id, error = %e, "Socket processing task failed");
                    inner.set_state(SocketState::Closed);
                    inner.fire_close();
                }
            }
            None => {
                inner.set_state(SocketState::Closed);
                inner.fire_close();
            }
        }
    }

    fn incoming_kbps(&self) -> f64 {
        self.inner.received.lock().kbps(Instant::now())
    }
}

// ============================================================================
// SocketInner - Processing
// ============================================================================

impl SocketInner {
    #[inline]
    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    #[inline]
    fn set_state(&self, state: SocketState) {
        *self.state.lock() = state;
    }

    fn listener(&self) -> Option<Arc<dyn SocketListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn fire_close(&self) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(socket_id = %self.id, "Socket closed");
        if let Some(listener) = self.listener() {
            listener.on_close();
        }
    }

    fn report_error(&self, error: &Error) {
        if let Some(listener) = self.listener() {
            listener.on_error(error);
        }
    }

    /// Hands a fresh stream to the next cycle.
    fn install_stream(&self, stream: WsStream) {
        *self.pending_stream.lock() = Some(stream);
        *self.cycle.lock() = self.stop.child_token();
    }

    /// Performs the opening handshake against the current URL.
    async fn open_stream(&self) -> Result<WsStream> {
        let url = self.url.read().clone();
        Url::parse(&url).map_err(|e| Error::config(format!("Invalid socket URL {url}: {e}")))?;

        let mut request = url.as_str().into_client_request()?;
        for (name, value) in &self.options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("Invalid header name {name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("Invalid value for header {name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let connect_timeout = self.options.connect_timeout;
        let (stream, response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("Handshake with {url} failed: {e}")))?;

        debug!(socket_id = %self.id, %url, status = %response.status(), "Socket connected");
        Ok(stream)
    }

    /// Runs processing cycles until the socket stops.
    async fn process(self: Arc<Self>) {
        loop {
            let Some(stream) = self.pending_stream.lock().take() else {
                break;
            };
            let cycle = self.cycle.lock().clone();
            *self.last_activity.lock() = Instant::now();

            let (write, read) = stream.split();
            tokio::join!(
                self.send_loop(write, cycle.clone()),
                self.receive_loop(read, cycle.clone()),
                self.idle_loop(cycle.clone()),
            );

            if self.stop.is_cancelled() || !self.options.auto_reconnect {
                break;
            }

            info!(socket_id = %self.id, "Socket connection lost, reconnecting");
            self.set_state(SocketState::Reconnecting);
            if let Some(listener) = self.listener() {
                listener.on_reconnecting();
            }

            if !self.reconnect_loop().await {
                break;
            }

            self.set_state(SocketState::Open);
            if let Some(listener) = self.listener() {
                listener.on_reconnected();
            }
        }

        self.set_state(SocketState::Closed);
        self.fire_close();
    }

    fn next_frame(&self) -> Option<String> {
        self.send_queue.lock().pop_front()
    }

    async fn send_loop(&self, mut write: SplitSink<WsStream, Message>, cycle: CancellationToken) {
        let mut healthy = true;

        'cycle: loop {
            while let Some(frame) = self.next_frame() {
                if let Some(limit) = self.options.rate_limit_per_second
                    && !self.wait_for_slot(limit, &cycle).await
                {
                    self.send_queue.lock().push_front(frame);
                    break 'cycle;
                }

                let sent = tokio::select! {
                    biased;
                    sent = write.send(Message::Text(frame.clone().into())) => sent,
                    _ = cycle.cancelled() => {
                        self.send_queue.lock().push_front(frame);
                        break 'cycle;
                    }
                };

                if let Err(e) = sent {
                    warn!(socket_id = %self.id, error = %e, "Failed to send frame");
                    self.report_error(&Error::WebSocket(e));
                    healthy = false;
                    break 'cycle;
                }
                self.throttle.lock().record(Instant::now());
            }

            tokio::select! {
                biased;
                _ = self.send_signal.notified() => {}
                _ = cycle.cancelled() => break,
            }
        }

        cycle.cancel();

        // frames queued before close still go out, reconnects drop them instead
        if healthy && self.stop.is_cancelled() {
            self.flush(&mut write).await;
        }
        let _ = timeout(CLOSE_TIMEOUT, write.close()).await;
        trace!(socket_id = %self.id, "Send loop finished");
    }

    /// Sends whatever is still queued, honoring the rate limit, within
    /// [`CLOSE_TIMEOUT`].
    async fn flush(&self, write: &mut SplitSink<WsStream, Message>) {
        let drain = async {
            let mut flushed = 0usize;
            while let Some(frame) = self.next_frame() {
                if let Some(limit) = self.options.rate_limit_per_second {
                    loop {
                        let delay = self.throttle.lock().delay(Instant::now(), limit);
                        let Some(delay) = delay else {
                            break;
                        };
                        sleep(delay.min(THROTTLE_POLL)).await;
                    }
                }

                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    debug!(socket_id = %self.id, error = %e, "Flush on close failed");
                    return flushed;
                }
                self.throttle.lock().record(Instant::now());
                flushed += 1;
            }
            flushed
        };

        match timeout(CLOSE_TIMEOUT, drain).await {
            Ok(0) => {}
            Ok(flushed) => trace!(socket_id = %self.id, flushed, "Flushed queued frames on close"),
            Err(_) => {
                let dropped = self.send_queue.lock().len();
                warn!(socket_id = %self.id, dropped, "Close timeout elapsed before queued frames were sent");
            }
        }
    }

    /// Waits until the rate limit allows another frame. Returns `false` if
    /// the cycle ended first.
    async fn wait_for_slot(&self, limit: u32, cycle: &CancellationToken) -> bool {
        loop {
            let delay = self.throttle.lock().delay(Instant::now(), limit);
            let Some(delay) = delay else {
                return true;
            };

            tokio::select! {
                _ = cycle.cancelled() => return false,
                _ = sleep(delay.min(THROTTLE_POLL)) => {}
            }
        }
    }

    async fn receive_loop(&self, mut read: SplitStream<WsStream>, cycle: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cycle.cancelled() => break,
                next = read.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.deliver(text.len(), Ok(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    let decoded = self.decode_binary(&data);
                    self.deliver(data.len(), decoded);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(socket_id = %self.id, ?frame, "Socket closed by remote");
                    break;
                }
                Some(Ok(_)) => {
                    *self.last_activity.lock() = Instant::now();
                }
                Some(Err(e)) => {
                    warn!(socket_id = %self.id, error = %e, "Socket receive failed");
                    self.report_error(&Error::WebSocket(e));
                    break;
                }
                None => {
                    debug!(socket_id = %self.id, "Socket stream ended");
                    break;
                }
            }
        }

        cycle.cancel();
        trace!(socket_id = %self.id, "Receive loop finished");
    }

    fn decode_binary(&self, data: &[u8]) -> Result<String> {
        match &self.options.bytes_interpreter {
            Some(interpret) => interpret(data),
            None => String::from_utf8(data.to_vec())
                .map_err(|e| Error::protocol(format!("Binary frame is not valid UTF-8: {e}"))),
        }
    }

    fn deliver(&self, size: usize, decoded: Result<String>) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        self.received.lock().record(now, size);

        let text = decoded.and_then(|text| match &self.options.text_interpreter {
            Some(interpret) => interpret(text),
            None => Ok(text),
        });

        match text {
            Ok(text) => {
                if let Some(listener) = self.listener() {
                    listener.on_message(text);
                }
            }
            Err(e) => {
                warn!(socket_id = %self.id, error = %e, "Dropping undecodable message");
            }
        }
    }

    async fn idle_loop(&self, cycle: CancellationToken) {
        let Some(idle_timeout) = self.options.idle_timeout else {
            return;
        };
        let check_every = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = sleep(check_every) => {}
            }

            let idle = self.last_activity.lock().elapsed();
            if idle > idle_timeout {
                warn!(
                    socket_id = %self.id,
                    idle_ms = idle.as_millis() as u64,
                    "No data received within idle timeout"
                );
                cycle.cancel();
                return;
            }
        }
    }

    /// Reconnects until it succeeds or the socket is stopped.
    ///
    /// Returns `false` if stopped.
    async fn reconnect_loop(&self) -> bool {
        self.send_queue.lock().clear();

        if let Some(listener) = self.listener()
            && let Some(url) = listener.reconnection_url().await
        {
            debug!(socket_id = %self.id, %url, "Reconnecting to new URL");
            *self.url.write() = url;
        }

        let last_reconnect = *self.last_reconnect.lock();
        if let Some(since) = last_reconnect.map(|at| at.elapsed())
            && since < self.options.reconnect_interval
            && !self.pause(self.options.reconnect_interval - since).await
        {
            return false;
        }

        loop {
            let attempt = tokio::select! {
                _ = self.stop.cancelled() => return false,
                attempt = self.open_stream() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    self.install_stream(stream);
                    *self.last_reconnect.lock() = Some(Instant::now());
                    info!(socket_id = %self.id, "Socket reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(socket_id = %self.id, error = %e, "Reconnect attempt failed");
                    self.report_error(&e);
                    if !self.pause(self.options.reconnect_interval).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration`. Returns `false` if stopped meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}

// ============================================================================
// WebSocketFactory
// ============================================================================

/// Creates [`WebSocket`]s. The default factory of the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl SocketFactory for WebSocketFactory {
    fn create(&self, url: &str, options: &SocketOptions) -> Arc<dyn Socket> {
        Arc::new(WebSocket::new(url, options.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================
