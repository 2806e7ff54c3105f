//! Endpoint-level error types.

use core::fmt;
use std::sync::Arc;

use crossbar_core::{ErrorCode, WireError};

/// Errors surfaced by channels, connections, and calls.
///
/// The transport never panics the process: every recoverable condition
/// becomes either a synchronous `Err` to the caller or a
/// [`CallOutcome::Error`](crate::CallOutcome::Error) on the affected call.
/// The enum is `Clone` because a connection reset fans one error out to
/// every operation in flight.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Binding the listener failed.
    ListenFailed {
        port: u16,
        host: String,
        source: Arc<std::io::Error>,
    },
    /// `listen` was already called on this channel.
    AlreadyListening,
    /// The listen host was empty or the unroutable wildcard.
    InvalidListenHost { host: String },
    /// The channel was closed; no further `request`/`listen`/`close`.
    Destroyed,
    /// A connection to the channel's own `host:port` was refused.
    SelfPeer { host_port: String },
    /// A dial target was malformed or a literal ephemeral.
    InvalidPeer { host_port: String },
    /// Dialing a peer failed.
    ConnectFailed {
        host_port: String,
        source: Arc<std::io::Error>,
    },
    /// The connection is closing and accepts no new operations.
    ConnectionClosing,
    /// The wrapped call-id counter collided with a live call.
    IdExhausted,
    /// The frame codec failed on this connection.
    ReadFailed {
        remote_name: String,
        local_name: String,
        source: WireError,
    },
    /// The peer violated the call protocol.
    Protocol {
        remote_name: String,
        reason: String,
    },
    /// The peer closed the connection.
    SocketClosed { remote_name: String },
    /// Two consecutive sweeps saw timeouts with no intervening frame.
    ConnectionDead { remote_name: String },
    /// The call exceeded its ttl.
    TimedOut,
    /// The channel was shut down while the call was in flight.
    Shutdown { reason: &'static str },
    /// The peer refuted the call with a call-error frame.
    Peer { code: ErrorCode, message: String },
    /// The call's args were already sent.
    ArgsAlreadySent,
    /// Streamed response args must be written in slot order.
    ResponseArgOrder,
    /// `register` was called while an incompatible handler was installed.
    InvalidHandlerForRegistration,
    Io(Arc<std::io::Error>),
}

impl ChannelError {
    /// The shutdown error every in-flight call receives on `Channel::close`.
    pub(crate) fn shutdown() -> Self {
        Self::Shutdown {
            reason: "shutdown from quit",
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenFailed { port, host, source } => {
                write!(f, "listen on {host}:{port} failed: {source}")
            }
            Self::AlreadyListening => write!(f, "channel is already listening"),
            Self::InvalidListenHost { host } => {
                write!(f, "invalid listen host {host:?}: need a routable address")
            }
            Self::Destroyed => write!(f, "channel was closed"),
            Self::SelfPeer { host_port } => {
                write!(f, "refusing connection to own address {host_port}")
            }
            Self::InvalidPeer { host_port } => write!(f, "invalid peer address {host_port:?}"),
            Self::ConnectFailed { host_port, source } => {
                write!(f, "connect to {host_port} failed: {source}")
            }
            Self::ConnectionClosing => write!(f, "connection is closing"),
            Self::IdExhausted => write!(f, "no free call id on this connection"),
            Self::ReadFailed {
                remote_name,
                local_name,
                source,
            } => write!(
                f,
                "read from {remote_name} failed at {local_name}: {source}"
            ),
            Self::Protocol {
                remote_name,
                reason,
            } => write!(f, "protocol violation from {remote_name}: {reason}"),
            Self::SocketClosed { remote_name } => {
                write!(f, "socket to {remote_name} closed")
            }
            Self::ConnectionDead { remote_name } => {
                write!(f, "connection to {remote_name} timed out")
            }
            Self::TimedOut => write!(f, "timed out"),
            Self::Shutdown { reason } => write!(f, "{reason}"),
            Self::Peer { code, message } => write!(f, "peer error ({code}): {message}"),
            Self::ArgsAlreadySent => write!(f, "call args were already sent"),
            Self::ResponseArgOrder => {
                write!(f, "streamed response args must be written in slot order")
            }
            Self::InvalidHandlerForRegistration => {
                write!(f, "cannot register endpoints on a custom handler")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ListenFailed { source, .. } | Self::ConnectFailed { source, .. } => {
                Some(&**source)
            }
            Self::ReadFailed { source, .. } => Some(source),
            Self::Io(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
