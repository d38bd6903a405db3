//! The seam between the tunnel and the secure transport it forwards through.
//!
//! The tunnel only needs two things from the transport: a way to dial and
//! authenticate against the jump server, and, on the resulting client, a way
//! to open a byte stream to an arbitrary address on the far side. The SSH
//! implementation lives in [`crate::ssh`]; tests substitute in-memory stubs.

use crate::endpoint::Endpoint;
use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Client: TransportClient;

    /// Connect and authenticate to `server`.
    async fn dial(&self, server: &Endpoint) -> Result<Self::Client>;
}

#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a logical channel to `remote` through this client.
    async fn open_channel(&self, remote: &Endpoint) -> Result<Self::Stream>;

    /// Tear down the client connection. Called at most once per client.
    async fn close(&self) -> Result<()>;
}
