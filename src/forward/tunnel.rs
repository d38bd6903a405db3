use crate::endpoint::Endpoint;
use crate::error::{Result, TunnelError};
use crate::forward::forwarder::Forwarder;
use crate::forward::registry::{Closable, Registry};
use crate::logger::Logger;
use crate::ssh::{AuthMethod, SshDialer, DEFAULT_SSH_PORT};
use crate::transport::{Dialer, TransportClient};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

/// Host the local listener binds to unless overridden.
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// Dial attempts per accepted connection unless overridden.
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 1;

/// Lifecycle of a single-use tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Unopened = 0,
    Open = 1,
    Serving = 2,
    Closed = 3,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unopened,
            1 => Self::Open,
            2 => Self::Serving,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unopened => write!(f, "unopened"),
            Self::Open => write!(f, "open"),
            Self::Serving => write!(f, "serving"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Registry entry for one raw connection. Closing it tells the owning
/// forwarder to drop the stream.
pub(crate) struct ConnHandle {
    label: String,
    shutdown: oneshot::Sender<()>,
}

impl ConnHandle {
    pub(crate) fn new(label: String) -> (Self, oneshot::Receiver<()>) {
        let (shutdown, closed) = oneshot::channel();
        (Self { label, shutdown }, closed)
    }
}

#[async_trait]
impl Closable for ConnHandle {
    async fn close(self) -> Result<()> {
        // The forwarder may already be gone, in which case the stream is too.
        if self.shutdown.send(()).is_err() {
            debug!(conn = %self.label, "connection already released");
        }
        Ok(())
    }
}

/// Registry entry for one transport client.
pub(crate) struct ClientHandle<C>(pub(crate) Arc<C>);

#[async_trait]
impl<C: TransportClient> Closable for ClientHandle<C> {
    async fn close(self) -> Result<()> {
        self.0.close().await
    }
}

pub(crate) struct Inner<D: Dialer> {
    pub(crate) dialer: D,
    pub(crate) server: Endpoint,
    pub(crate) remote: Endpoint,
    local: Endpoint,
    bound_port: OnceLock<u16>,
    max_connection_attempts: u32,
    logger: Option<Arc<dyn Logger>>,
    state: AtomicU8,
    close_tx: watch::Sender<bool>,
    pub(crate) conns: Registry<ConnHandle>,
    pub(crate) clients: Registry<ClientHandle<D::Client>>,
}

impl<D: Dialer> Inner<D> {
    pub(crate) fn logf(&self, args: fmt::Arguments<'_>) {
        if let Some(logger) = &self.logger {
            logger.log(args);
        }
    }

    pub(crate) fn close(&self) {
        self.close_tx.send_replace(true);
    }

    fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: TunnelState, to: TunnelState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| TunnelError::InvalidState {
                expected: from,
                actual: TunnelState::from_u8(actual),
            })
    }

    fn expect_state(&self, expected: TunnelState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(TunnelError::InvalidState { expected, actual })
        }
    }

    fn local(&self) -> Endpoint {
        let mut local = self.local.clone();
        if let Some(port) = self.bound_port.get() {
            local.port = *port;
        }
        local
    }
}

async fn close_signalled(close_rx: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which only happens with the tunnel itself.
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Configures a [`Tunnel`] before it is opened.
pub struct TunnelBuilder {
    server: Endpoint,
    remote: Endpoint,
    local: Endpoint,
    max_connection_attempts: u32,
    logger: Option<Arc<dyn Logger>>,
}

impl TunnelBuilder {
    fn new(mut server: Endpoint, remote: Endpoint) -> Self {
        if server.port == 0 {
            server.port = DEFAULT_SSH_PORT;
        }
        Self {
            server,
            remote,
            local: Endpoint::new(DEFAULT_LOCAL_HOST, 0),
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            logger: None,
        }
    }

    /// Port for the local listener; 0 picks an ephemeral port.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local.port = port;
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local.host = host.into();
        self
    }

    /// Dial attempts per accepted connection. 0 behaves like 1.
    pub fn max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Build a tunnel that reaches the server over SSH with `auth`.
    pub fn build(self, auth: AuthMethod) -> Tunnel<SshDialer> {
        self.build_with_dialer(SshDialer::new(auth))
    }

    pub fn build_with_dialer<D: Dialer>(self, dialer: D) -> Tunnel<D> {
        let (close_tx, _) = watch::channel(false);
        Tunnel {
            inner: Arc::new(Inner {
                dialer,
                server: self.server,
                remote: self.remote,
                local: self.local,
                bound_port: OnceLock::new(),
                max_connection_attempts: self.max_connection_attempts,
                logger: self.logger,
                state: AtomicU8::new(TunnelState::Unopened as u8),
                close_tx,
                conns: Registry::new(),
                clients: Registry::new(),
            }),
        }
    }
}

/// A single-use local listener forwarding through a jump server to `remote`.
///
/// `Tunnel` is a cheap handle: clones share the same tunnel, so one task can
/// sit in [`serve`](Tunnel::serve) while another calls
/// [`close`](Tunnel::close).
pub struct Tunnel<D: Dialer = SshDialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for Tunnel<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Dialer> fmt::Debug for Tunnel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("local", &self.inner.local())
            .field("server", &self.inner.server)
            .field("remote", &self.inner.remote)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Tunnel<SshDialer> {
    /// Create an SSH tunnel listening on `localhost:local_port`.
    ///
    /// A server port of 0 becomes 22 and a local port of 0 is ephemeral.
    /// Host keys are accepted without verification; use
    /// [`TunnelBuilder::build_with_dialer`] with a configured
    /// [`SshDialer`] to change that.
    pub fn new(server: Endpoint, remote: Endpoint, auth: AuthMethod, local_port: u16) -> Self {
        Self::builder(server, remote).local_port(local_port).build(auth)
    }

    pub fn builder(server: Endpoint, remote: Endpoint) -> TunnelBuilder {
        TunnelBuilder::new(server, remote)
    }
}

impl<D: Dialer> Tunnel<D> {
    /// The local endpoint; after [`listen`](Self::listen) it carries the bound port.
    pub fn local(&self) -> Endpoint {
        self.inner.local()
    }

    pub fn server(&self) -> &Endpoint {
        &self.inner.server
    }

    pub fn remote(&self) -> &Endpoint {
        &self.inner.remote
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state()
    }

    pub fn max_connection_attempts(&self) -> u32 {
        self.inner.max_connection_attempts
    }

    /// Whether shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        *self.inner.close_tx.borrow()
    }

    /// Bind the local listener. Must precede [`serve`](Self::serve).
    pub async fn listen(&self) -> Result<TcpListener> {
        self.inner.expect_state(TunnelState::Unopened)?;

        let addr = self.inner.local.to_string();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener.local_addr()?.port();
        let _ = self.inner.bound_port.set(port);
        self.inner.transition(TunnelState::Unopened, TunnelState::Open)?;

        info!(
            local = %self.local(),
            server = %self.inner.server,
            remote = %self.inner.remote,
            "tunnel listening"
        );
        Ok(listener)
    }

    /// Run the accept loop until [`close`](Self::close) is called, then close
    /// every tracked connection and client.
    #[instrument(name = "tunnel_serve", skip_all, fields(local = %self.local(), remote = %self.inner.remote))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.inner
            .transition(TunnelState::Open, TunnelState::Serving)?;

        let inner = &self.inner;
        let attempts = inner.max_connection_attempts.max(1);
        let mut close_rx = inner.close_tx.subscribe();

        loop {
            inner.logf(format_args!("listening for new connections..."));

            tokio::select! {
                biased;

                _ = close_signalled(&mut close_rx) => {
                    inner.logf(format_args!("close signal received, closing..."));
                    debug!("close signal received");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let (handle, closed) = ConnHandle::new(format!("local {}", peer));
                            let Some(local_id) = inner.conns.register(handle).await else {
                                continue;
                            };
                            inner.logf(format_args!("accepted connection"));
                            debug!(%peer, "accepted connection");

                            let forwarder = Forwarder::new(inner.clone(), attempts);
                            tokio::spawn(forwarder.run(stream, local_id, closed));
                        }
                        Err(e) => {
                            inner.logf(format_args!("accept error: {}", e));
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        for outcome in inner.conns.drain().await {
            inner.logf(format_args!(
                "closing the netConn ({} of {})",
                outcome.index, outcome.total
            ));
            if let Err(e) = outcome.result {
                inner.logf(format_args!("{}", e));
            }
        }
        for outcome in inner.clients.drain().await {
            inner.logf(format_args!(
                "closing the serverConn ({} of {})",
                outcome.index, outcome.total
            ));
            if let Err(e) = outcome.result {
                inner.logf(format_args!("{}", e));
                warn!("Failed to close server connection: {}", e);
            }
        }
        drop(listener);

        inner.state.store(TunnelState::Closed as u8, Ordering::SeqCst);
        inner.logf(format_args!("tunnel closed"));
        info!("tunnel closed");
        Ok(())
    }

    /// Request shutdown. Safe to call any number of times from any task.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_tunnel(server_port: u16, local_port: u16) -> Tunnel {
        Tunnel::new(
            Endpoint::new("jump.example.com", server_port).with_user("deploy"),
            Endpoint::new("db.internal", 5432),
            AuthMethod::password("secret"),
            local_port,
        )
    }

    #[test]
    fn test_new_defaults_server_port() {
        let tunnel = ssh_tunnel(0, 0);
        assert_eq!(tunnel.server().port, DEFAULT_SSH_PORT);
        assert_eq!(tunnel.server().user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_new_keeps_explicit_server_port() {
        assert_eq!(ssh_tunnel(2222, 0).server().port, 2222);
    }

    #[test]
    fn test_new_local_endpoint() {
        let tunnel = ssh_tunnel(22, 4022);
        assert_eq!(tunnel.local().to_string(), "localhost:4022");
        assert_eq!(tunnel.state(), TunnelState::Unopened);
        assert_eq!(tunnel.max_connection_attempts(), DEFAULT_MAX_CONNECTION_ATTEMPTS);
        assert!(!tunnel.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let tunnel = ssh_tunnel(22, 0);
        tunnel.close();
        tunnel.close();
        tunnel.clone().close();
        assert!(tunnel.is_closed());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Unopened.to_string(), "unopened");
        assert_eq!(TunnelState::Closed.to_string(), "closed");
        for state in [
            TunnelState::Unopened,
            TunnelState::Open,
            TunnelState::Serving,
            TunnelState::Closed,
        ] {
            assert_eq!(TunnelState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let tunnel = Tunnel::builder(Endpoint::new("jump", 22), Endpoint::new("db", 5432))
            .local_host("127.0.0.1")
            .build(AuthMethod::password("secret"));
        let _listener = tunnel.listen().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Open);

        let err = tunnel.listen().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::InvalidState {
                expected: TunnelState::Unopened,
                actual: TunnelState::Open
            }
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_tunnel_unopened() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let tunnel = Tunnel::builder(Endpoint::new("jump", 22), Endpoint::new("db", 5432))
            .local_host("127.0.0.1")
            .local_port(port)
            .build(AuthMethod::password("secret"));

        let err = tunnel.listen().await.unwrap_err();

        assert!(matches!(err, TunnelError::Bind { .. }), "unexpected: {err}");
        assert_eq!(tunnel.state(), TunnelState::Unopened);
        assert_eq!(tunnel.local().port, port);
    }
}
