//! A single-use local TCP listener that forwards every accepted connection
//! through an SSH jump server to a destination only reachable from there.
//!
//! This crate provides:
//! - [`Tunnel`]: bind, accept loop, and a shutdown drain that closes every
//!   tracked connection and SSH client exactly once
//! - [`SshDialer`]: the russh-backed transport, with pluggable host key checks
//! - [`Dialer`] / [`TransportClient`]: the seam for substituting the transport
//!
//! ```no_run
//! use ssh_tunnel::{AuthMethod, Endpoint, Tunnel};
//!
//! # async fn run() -> ssh_tunnel::Result<()> {
//! let tunnel = Tunnel::new(
//!     Endpoint::new("jump.example.com", 0).with_user("deploy"),
//!     Endpoint::new("db.internal", 5432),
//!     AuthMethod::password("secret"),
//!     0,
//! );
//! let listener = tunnel.listen().await?;
//! println!("forwarding {} -> {}", tunnel.local(), tunnel.remote());
//!
//! let closer = tunnel.clone();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     closer.close();
//! });
//! tunnel.serve(listener).await
//! # }
//! ```

pub mod endpoint;
pub mod error;
pub mod forward;
pub mod logger;
pub mod ssh;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{Result, TunnelError};
pub use forward::{Tunnel, TunnelBuilder, TunnelState};
pub use logger::{Logger, TracingLogger};
pub use ssh::{AuthMethod, HostKeyPolicy, SshClient, SshDialer};
pub use transport::{Dialer, TransportClient};
