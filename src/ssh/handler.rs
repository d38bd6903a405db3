use crate::endpoint::Endpoint;
use russh::client::Handler;
use russh::keys::PublicKey;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether a server's host key is trusted.
pub type HostKeyCallback = Arc<dyn Fn(&Endpoint, &PublicKey) -> bool + Send + Sync>;

/// How to handle SSH host key verification.
#[derive(Clone, Default)]
pub enum HostKeyPolicy {
    /// Accept every key, like `ssh -o StrictHostKeyChecking=no`.
    #[default]
    AcceptAll,
    /// Delegate the decision to the caller.
    Custom(HostKeyCallback),
}

impl HostKeyPolicy {
    pub fn custom<F>(callback: F) -> Self
    where
        F: Fn(&Endpoint, &PublicKey) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(callback))
    }

    pub fn verify(&self, server: &Endpoint, key: &PublicKey) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::Custom(callback) => callback(server, key),
        }
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => write!(f, "AcceptAll"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug)]
pub struct ClientHandler {
    server: Endpoint,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(server: Endpoint, policy: HostKeyPolicy) -> Self {
        Self { server, policy }
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.policy.verify(&self.server, server_public_key);
        if accepted {
            debug!(server = %self.server, policy = ?self.policy, "host key accepted");
        } else {
            warn!(server = %self.server, "host key rejected");
        }
        Ok(accepted)
    }
}
