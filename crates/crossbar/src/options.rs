//! Channel and request configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::handler::RequestHandler;

/// Default ttl stamped on outbound calls that set no explicit timeout.
pub const DEFAULT_OUTGOING_REQUEST_TTL: Duration = Duration::from_millis(2000);

/// Default per-outbound-call timeout used by the sweep when an entry has no
/// ttl of its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default per-inbound-call timeout.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default base period of the timeout sweep.
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Default jitter window of the timeout sweep.
pub const DEFAULT_TIMEOUT_FUZZ: Duration = Duration::from_millis(100);

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Clone)]
pub struct ChannelOptions {
    /// Name advertised to peers in the init exchange.
    pub process_name: String,
    /// Sweep timeout for outbound calls whose entry carries no ttl.
    pub req_timeout_default: Duration,
    /// Sweep timeout for inbound calls.
    pub server_timeout_default: Duration,
    /// Base period of the timeout sweep.
    pub timeout_check_interval: Duration,
    /// Jitter window: each sweep fires `base - fuzz/2 + rand(0..fuzz)` after
    /// the previous one.
    pub timeout_fuzz: Duration,
    /// Seed for the sweep jitter. Tests set this for determinism; `None`
    /// seeds from entropy.
    pub rng_seed: Option<u64>,
    /// Request handler for inbound calls. Defaults to a handler that replies
    /// not-ok with "no handler defined".
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            req_timeout_default: DEFAULT_REQUEST_TIMEOUT,
            server_timeout_default: DEFAULT_SERVER_TIMEOUT,
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            timeout_fuzz: DEFAULT_TIMEOUT_FUZZ,
            rng_seed: None,
            handler: None,
        }
    }
}

impl ChannelOptions {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            ..Self::default()
        }
    }
}

/// Options for one outbound call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// The peer's `host:port`.
    pub host: String,
    /// Per-call timeout; when unset the call carries
    /// [`DEFAULT_OUTGOING_REQUEST_TTL`].
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
