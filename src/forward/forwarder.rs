use crate::error::{Result, TunnelError};
use crate::forward::registry::EntryId;
use crate::forward::tunnel::{ClientHandle, ConnHandle, Inner};
use crate::transport::{Dialer, TransportClient};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

/// Both hops of one forwarded connection.
struct Established<C: TransportClient> {
    client: Arc<C>,
    client_id: EntryId,
    stream: C::Stream,
    remote_id: EntryId,
    remote_closed: oneshot::Receiver<()>,
}

/// Carries one accepted local connection through the jump server.
///
/// Failing to reach the server or the remote closes the whole tunnel: the
/// jump server is treated as required infrastructure, not a per-connection
/// resource.
pub(crate) struct Forwarder<D: Dialer> {
    tunnel: Arc<Inner<D>>,
    max_attempts: u32,
}

impl<D: Dialer> Forwarder<D> {
    pub(crate) fn new(tunnel: Arc<Inner<D>>, max_attempts: u32) -> Self {
        Self {
            tunnel,
            max_attempts,
        }
    }

    #[instrument(name = "forward", skip_all, fields(local = %local_id))]
    pub(crate) async fn run(
        self,
        local: TcpStream,
        local_id: EntryId,
        mut local_closed: oneshot::Receiver<()>,
    ) {
        let established = tokio::select! {
            result = self.connect() => result,
            _ = &mut local_closed => Err(TunnelError::Closed),
        };

        match established {
            Ok(established) => {
                self.relay(local, local_id, local_closed, established)
                    .await
            }
            Err(TunnelError::Closed) => {
                debug!("tunnel closed before the connection was established");
            }
            Err(e) => {
                self.tunnel.logf(format_args!("{}", e));
                warn!(
                    server = %self.tunnel.server,
                    remote = %self.tunnel.remote,
                    "{}, closing tunnel", e
                );
                self.tunnel.close();
            }
        }
    }

    async fn connect(&self) -> Result<Established<D::Client>> {
        let tunnel = &self.tunnel;

        let client = Arc::new(self.dial_with_retry().await?);
        tunnel.logf(format_args!("connected to {} (1 of 2)", tunnel.server));
        let client_id = tunnel
            .clients
            .register(ClientHandle(client.clone()))
            .await
            .ok_or(TunnelError::Closed)?;

        tunnel.logf(format_args!("dialing remote {}", tunnel.remote));
        let stream = client
            .open_channel(&tunnel.remote)
            .await
            .map_err(|e| TunnelError::ChannelOpen(Box::new(e)))?;
        let (handle, remote_closed) = ConnHandle::new(format!("remote {}", tunnel.remote));
        let remote_id = tunnel
            .conns
            .register(handle)
            .await
            .ok_or(TunnelError::Closed)?;
        tunnel.logf(format_args!("connected to {} (2 of 2)", tunnel.remote));

        Ok(Established {
            client,
            client_id,
            stream,
            remote_id,
            remote_closed,
        })
    }

    async fn dial_with_retry(&self) -> Result<D::Client> {
        let server = &self.tunnel.server;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.tunnel.logf(format_args!("dialing jump {}", server));

            match self.tunnel.dialer.dial(server).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(TunnelError::DialExhausted {
                        attempts: self.max_attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!(%server, attempt, max_attempts = self.max_attempts, "server dial failed: {}", e);
                }
            }
        }
    }

    async fn relay(
        self,
        local: TcpStream,
        local_id: EntryId,
        mut local_closed: oneshot::Receiver<()>,
        established: Established<D::Client>,
    ) {
        let Established {
            client,
            client_id,
            stream,
            remote_id,
            mut remote_closed,
        } = established;

        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = tokio::io::split(stream);

        let mut upstream = tokio::spawn(pipe(
            self.tunnel.clone(),
            "local->remote",
            local_read,
            remote_write,
        ));
        let mut downstream = tokio::spawn(pipe(
            self.tunnel.clone(),
            "remote->local",
            remote_read,
            local_write,
        ));

        let finished = tokio::select! {
            _ = async { tokio::join!(&mut upstream, &mut downstream) } => true,
            _ = &mut local_closed => false,
            _ = &mut remote_closed => false,
        };
        upstream.abort();
        downstream.abort();

        if !finished {
            debug!("relay stopped by tunnel shutdown");
            return;
        }

        // Whatever the drain has not claimed yet is ours to release.
        self.tunnel.conns.remove(local_id).await;
        self.tunnel.conns.remove(remote_id).await;
        if self.tunnel.clients.remove(client_id).await.is_some() {
            if let Err(e) = client.close().await {
                self.tunnel.logf(format_args!("{}", e));
                debug!("Failed to close server connection: {}", e);
            }
        }
        debug!("relay finished");
    }
}

/// Copy one direction until EOF or error, then half-close the writer.
async fn pipe<D, R, W>(tunnel: Arc<Inner<D>>, direction: &'static str, mut reader: R, mut writer: W)
where
    D: Dialer,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => trace!(direction, bytes, "relay direction finished"),
        Err(e) => {
            tunnel.logf(format_args!("copy error ({}): {}", direction, e));
            debug!(direction, "copy error: {}", e);
        }
    }
    let _ = writer.shutdown().await;
}
