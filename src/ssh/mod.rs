pub mod client;
pub mod handler;

pub use client::{AuthMethod, SshClient, SshDialer};
pub use handler::{ClientHandler, HostKeyCallback, HostKeyPolicy};

/// Port the SSH server is assumed to listen on when none is given.
pub const DEFAULT_SSH_PORT: u16 = 22;
