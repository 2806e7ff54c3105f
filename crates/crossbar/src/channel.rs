//! Channel: the top-level endpoint.
//!
//! A channel acts concurrently as client and server: it can listen for
//! inbound connections, dial peers on demand, and multiplex calls both ways
//! over whatever connections exist. Closing a channel resets every open
//! connection exactly once and resolves when all of them have torn down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crossbar_core::EPHEMERAL_HOST_PORT;

use crate::connection::{Connection, Direction};
use crate::handler::{EndpointRouter, NoHandler, RequestHandler};
use crate::peers::{parse_host_port, PeerRegistry};
use crate::{ChannelError, ChannelOptions, IncomingRequest, OutgoingCall, RequestOptions, Responder};

struct HandlerSlot {
    handler: Arc<dyn RequestHandler>,
    /// Set when `register` installed the endpoint router.
    router: Option<Arc<EndpointRouter>>,
    /// True when the handler came from the caller rather than the default.
    customized: bool,
}

pub(crate) struct ChannelShared {
    options: ChannelOptions,
    peers: PeerRegistry,
    handler: Mutex<HandlerSlot>,
    /// Local `host:port`, filled in once `listen` has bound.
    host_port: Mutex<Option<String>>,
    /// Every open connection, registered or not, for shutdown.
    connections: Mutex<Vec<Connection>>,
    destroyed: AtomicBool,
    listen_started: AtomicBool,
    listener_shutdown: CancellationToken,
    /// The accept-loop task; `close` joins it so the listening socket is
    /// released before the close resolves.
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelShared {
    pub(crate) fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub(crate) fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub(crate) fn host_port(&self) -> Option<String> {
        self.host_port.lock().clone()
    }

    /// The address advertised in init frames; ephemeral when not listening.
    pub(crate) fn advertised_host_port(&self) -> String {
        self.host_port()
            .unwrap_or_else(|| EPHEMERAL_HOST_PORT.to_string())
    }

    pub(crate) fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler.lock().handler.clone()
    }

    pub(crate) fn track_connection(&self, conn: Connection) {
        self.connections.lock().push(conn);
    }

    pub(crate) fn untrack_connection(&self, inner: &crate::connection::ConnectionInner) {
        self.connections
            .lock()
            .retain(|c| !std::ptr::eq(Arc::as_ptr(&c.inner), inner));
    }
}

/// A bidirectional RPC endpoint.
///
/// Cheap to clone; all clones share the same endpoint.
///
/// # Example
///
/// ```ignore
/// let server = Channel::new(ChannelOptions::new("echo-server"));
/// server.register("echo", |req: IncomingRequest, responder: Responder| async move {
///     let _ = responder.send_ok(req.arg2, req.arg3).await;
/// })?;
/// let host_port = server.listen(0, "127.0.0.1").await?;
///
/// let client = Channel::new(ChannelOptions::new("echo-client"));
/// let call = client.request(RequestOptions::new(host_port)).await?;
/// let outcome = call.send("echo", "header", "body").await;
/// ```
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new(options: ChannelOptions) -> Self {
        let customized = options.handler.is_some();
        let handler: Arc<dyn RequestHandler> = options
            .handler
            .clone()
            .unwrap_or_else(|| Arc::new(NoHandler));
        Self {
            shared: Arc::new(ChannelShared {
                options,
                peers: PeerRegistry::new(),
                handler: Mutex::new(HandlerSlot {
                    handler,
                    router: None,
                    customized,
                }),
                host_port: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
                listen_started: AtomicBool::new(false),
                listener_shutdown: CancellationToken::new(),
                listener_task: Mutex::new(None),
            }),
        }
    }

    /// Bind and start accepting connections. At most one call per channel.
    ///
    /// `host` must be a routable address, not the `0.0.0.0` wildcard, so the
    /// advertised `host:port` is meaningful to peers. Port 0 asks the OS for
    /// an ephemeral port. Returns the bound `host:port`.
    pub async fn listen(&self, port: u16, host: &str) -> Result<String, ChannelError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ChannelError::Destroyed);
        }
        if host.is_empty() || host == "0.0.0.0" {
            return Err(ChannelError::InvalidListenHost {
                host: host.to_string(),
            });
        }
        if self.shared.listen_started.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyListening);
        }

        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.listen_started.store(false, Ordering::SeqCst);
                return Err(ChannelError::ListenFailed {
                    port,
                    host: host.to_string(),
                    source: Arc::new(err),
                });
            }
        };
        let local = listener.local_addr().map_err(|err| ChannelError::ListenFailed {
            port,
            host: host.to_string(),
            source: Arc::new(err),
        })?;

        let host_port = format!("{host}:{}", local.port());
        *self.shared.host_port.lock() = Some(host_port.clone());
        self.shared.peers.set_local(host_port.clone());

        let task = tokio::spawn(accept_loop(self.shared.clone(), listener));
        *self.shared.listener_task.lock() = Some(task);
        tracing::info!(%host_port, "listening");
        Ok(host_port)
    }

    /// The bound `host:port`, once listening.
    pub fn host_port(&self) -> Option<String> {
        self.shared.host_port()
    }

    /// Start an outbound call to `options.host`, reusing an open connection
    /// when one exists.
    pub async fn request(&self, options: RequestOptions) -> Result<OutgoingCall, ChannelError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ChannelError::Destroyed);
        }
        let conn = self.get_or_create_outbound(&options.host).await?;
        conn.request(options.timeout).await
    }

    /// Install an endpoint function, creating the endpoint router on first
    /// use. Fails if a custom handler is already installed.
    pub fn register<F, Fut>(&self, name: impl Into<String>, endpoint: F) -> Result<(), ChannelError>
    where
        F: Fn(IncomingRequest, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.shared.handler.lock();
        if let Some(router) = &slot.router {
            router.register(name, endpoint);
            return Ok(());
        }
        if slot.customized {
            return Err(ChannelError::InvalidHandlerForRegistration);
        }
        let router = Arc::new(EndpointRouter::new());
        router.register(name, endpoint);
        slot.handler = router.clone();
        slot.router = Some(router);
        Ok(())
    }

    /// Close the channel exactly once: stop the listener, reset every open
    /// connection, and resolve when the listening socket and every
    /// connection have reported closed.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Destroyed);
        }
        self.shared.listener_shutdown.cancel();

        // Join the accept loop first: the listening socket is dropped with
        // it, and no connection can be accepted after the snapshot below.
        let listener_task = self.shared.listener_task.lock().take();
        if let Some(task) = listener_task {
            let _ = task.await;
        }

        let conns: Vec<Connection> = self.shared.connections.lock().clone();
        for conn in &conns {
            conn.shut_down(ChannelError::shutdown()).await;
        }
        futures::future::join_all(conns.iter().map(|conn| conn.closed())).await;

        self.shared.peers.clear();
        self.shared.connections.lock().clear();
        tracing::debug!(connections = conns.len(), "channel closed");
        Ok(())
    }

    /// Open connections whose peer identified as `host_port`.
    pub fn connections_to(&self, host_port: &str) -> Vec<Connection> {
        self.shared.peers.connections_to(host_port)
    }

    /// Every open connection, identified or not.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections.lock().clone()
    }

    /// Number of distinct identified peers.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.peer_count()
    }

    async fn get_or_create_outbound(&self, host_port: &str) -> Result<Connection, ChannelError> {
        if host_port.is_empty() {
            return Err(ChannelError::InvalidPeer {
                host_port: String::new(),
            });
        }
        if let Some(conn) = self.shared.peers.get(host_port) {
            return Ok(conn);
        }

        let (host, port) = parse_host_port(host_port)?;
        if self.shared.host_port().as_deref() == Some(host_port) {
            return Err(ChannelError::SelfPeer {
                host_port: host_port.to_string(),
            });
        }

        let stream = TcpStream::connect((host.as_str(), port)).await.map_err(|err| {
            ChannelError::ConnectFailed {
                host_port: host_port.to_string(),
                source: Arc::new(err),
            }
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%host_port, error = %err, "set_nodelay failed");
        }
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| host_port.to_string());

        let conn = Connection::spawn(
            self.shared.clone(),
            Box::new(stream),
            Direction::Outbound,
            remote_addr,
        )?;
        conn.set_peer_key(host_port);
        if let Err(err) = self.shared.peers.insert(host_port, conn.clone()) {
            conn.shut_down(err.clone()).await;
            return Err(err);
        }
        tracing::debug!(%host_port, "dialed peer");
        Ok(conn)
    }
}

async fn accept_loop(shared: Arc<ChannelShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.listener_shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(%peer_addr, error = %err, "set_nodelay failed");
                    }
                    match Connection::spawn(
                        shared.clone(),
                        Box::new(stream),
                        Direction::Inbound,
                        peer_addr.to_string(),
                    ) {
                        Ok(_conn) => tracing::debug!(%peer_addr, "accepted connection"),
                        Err(err) => tracing::warn!(%peer_addr, error = %err, "rejected connection"),
                    }
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }
}
