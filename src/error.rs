use crate::forward::TunnelState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel is {actual}, expected {expected}")]
    InvalidState {
        expected: TunnelState,
        actual: TunnelState,
    },

    #[error("Invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("SSH connection failed: {0}")]
    Connection(String),

    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("SSH key error: {0}")]
    Key(String),

    #[error("server dial error: {source}: exceeded {attempts} attempts")]
    DialExhausted {
        attempts: u32,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("remote dial error: {0}")]
    ChannelOpen(#[source] Box<TunnelError>),

    #[error("Tunnel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
