//! Client and socket configuration.
//!
//! [`ClientOptions`] holds the pool-level policy (response timeout, combine
//! target, connection cap, resubscription concurrency). Transport-level
//! settings live in the nested [`SocketOptions`] and are handed to every
//! socket the pool creates.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ws_multiplex::{ClientOptions, SocketOptions};
//!
//! let options = ClientOptions::new()
//!     .with_response_timeout(Duration::from_secs(5))
//!     .with_combine_target(20)
//!     .with_max_connections(4)
//!     .with_socket(
//!         SocketOptions::new()
//!             .with_idle_timeout(Duration::from_secs(30))
//!             .with_rate_limit(10),
//!     );
//!
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for a request's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of user subscriptions per connection before a new one is opened.
pub const DEFAULT_COMBINE_TARGET: usize = 10;

/// Default number of subscribe requests resent in parallel after a reconnect.
pub const DEFAULT_MAX_CONCURRENT_RESUBSCRIPTIONS: usize = 5;

/// Default total handler time after which a dispatch is logged as slow.
pub const DEFAULT_SLOW_HANDLER_THRESHOLD: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

/// Decodes a binary frame into text before it is routed.
pub type BytesInterpreter = Arc<dyn Fn(&[u8]) -> Result<String> + Send + Sync>;

/// Rewrites a text frame before it is routed.
pub type TextInterpreter = Arc<dyn Fn(String) -> Result<String> + Send + Sync>;

// ============================================================================
// SocketOptions
// ============================================================================

/// Transport-level settings for a single socket.
#[derive(Clone)]
pub struct SocketOptions {
    /// Reconnect automatically when the socket drops.
    pub auto_reconnect: bool,

    /// Minimum time between reconnects, also the delay between failed attempts.
    pub reconnect_interval: Duration,

    /// Maximum time allowed for the opening handshake.
    pub connect_timeout: Duration,

    /// Reconnect when nothing has been received for this long.
    pub idle_timeout: Option<Duration>,

    /// Maximum outbound frames in any trailing one-second window.
    pub rate_limit_per_second: Option<u32>,

    /// Extra headers sent with the upgrade request.
    pub headers: Vec<(String, String)>,

    /// Binary frame decoder. UTF-8 is assumed when unset.
    pub bytes_interpreter: Option<BytesInterpreter>,

    /// Text frame rewriter applied after decoding.
    pub text_interpreter: Option<TextInterpreter>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("rate_limit_per_second", &self.rate_limit_per_second)
            .field("headers", &self.headers.len())
            .field("bytes_interpreter", &self.bytes_interpreter.is_some())
            .field("text_interpreter", &self.text_interpreter.is_some())
            .finish()
    }
}

impl SocketOptions {
    /// Creates socket options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            rate_limit_per_second: None,
            headers: Vec::new(),
            bytes_interpreter: None,
            text_interpreter: None,
        }
    }

    /// Enables or disables automatic reconnection.
    #[inline]
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the reconnect interval.
    #[inline]
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the no-data timeout after which the socket reconnects.
    #[inline]
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Limits outbound frames per second.
    #[inline]
    #[must_use]
    pub fn with_rate_limit(mut self, frames_per_second: u32) -> Self {
        self.rate_limit_per_second = Some(frames_per_second);
        self
    }

    /// Adds a header to the upgrade request.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the binary frame decoder.
    #[inline]
    #[must_use]
    pub fn with_bytes_interpreter(
        mut self,
        interpreter: impl Fn(&[u8]) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.bytes_interpreter = Some(Arc::new(interpreter));
        self
    }

    /// Sets the text frame rewriter.
    #[inline]
    #[must_use]
    pub fn with_text_interpreter(
        mut self,
        interpreter: impl Fn(String) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.text_interpreter = Some(Arc::new(interpreter));
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero timeouts or a zero rate limit.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be greater than zero"));
        }

        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("idle_timeout must be greater than zero"));
        }

        if self.rate_limit_per_second == Some(0) {
            return Err(Error::config("rate_limit_per_second cannot be 0"));
        }

        Ok(())
    }
}

// ============================================================================
// ClientOptions
// ============================================================================

/// Pool-level settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Time to wait for a subscribe, query or authentication response.
    pub response_timeout: Duration,

    /// User subscriptions per connection before another connection is opened.
    pub subscriptions_combine_target: usize,

    /// Connection count at which reuse beyond the combine target is forced.
    pub max_connections: Option<usize>,

    /// Pause after a fresh connect before anything is sent.
    pub delay_after_connect: Duration,

    /// Subscribe requests resent in parallel after a reconnect.
    pub max_concurrent_resubscriptions: usize,

    /// Total handler time per message above which a warning is logged.
    pub slow_handler_threshold: Duration,

    /// Attach the raw message text to delivered events.
    pub output_original_data: bool,

    /// Transport settings for every socket.
    pub socket: SocketOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientOptions {
    /// Creates client options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            subscriptions_combine_target: DEFAULT_COMBINE_TARGET,
            max_connections: None,
            delay_after_connect: Duration::ZERO,
            max_concurrent_resubscriptions: DEFAULT_MAX_CONCURRENT_RESUBSCRIPTIONS,
            slow_handler_threshold: DEFAULT_SLOW_HANDLER_THRESHOLD,
            output_original_data: false,
            socket: SocketOptions::new(),
        }
    }

    /// Sets the response timeout.
    #[inline]
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the subscriptions combine target.
    #[inline]
    #[must_use]
    pub fn with_combine_target(mut self, target: usize) -> Self {
        self.subscriptions_combine_target = target;
        self
    }

    /// Caps the number of connections.
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Sets the pause after connecting.
    #[inline]
    #[must_use]
    pub fn with_delay_after_connect(mut self, delay: Duration) -> Self {
        self.delay_after_connect = delay;
        self
    }

    /// Sets resubscription concurrency.
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_resubscriptions(mut self, max: usize) -> Self {
        self.max_concurrent_resubscriptions = max;
        self
    }

    /// Sets the slow handler warning threshold.
    #[inline]
    #[must_use]
    pub fn with_slow_handler_threshold(mut self, threshold: Duration) -> Self {
        self.slow_handler_threshold = threshold;
        self
    }

    /// Attaches raw message text to delivered events.
    #[inline]
    #[must_use]
    pub fn with_original_data(mut self) -> Self {
        self.output_original_data = true;
        self
    }

    /// Replaces the transport settings.
    #[inline]
    #[must_use]
    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.subscriptions_combine_target == 0 {
            return Err(Error::config("subscriptions_combine_target cannot be 0"));
        }

        if self.max_connections == Some(0) {
            return Err(Error::config("max_connections cannot be 0"));
        }

        if self.max_concurrent_resubscriptions == 0 {
            return Err(Error::config("max_concurrent_resubscriptions cannot be 0"));
        }

        if self.response_timeout.is_zero() {
            return Err(Error::config("response_timeout must be greater than zero"));
        }

        self.socket.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
