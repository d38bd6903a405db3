//! The tunnel lifecycle: local listener, accept loop, per-connection
//! forwarding, and the shutdown drain.

mod forwarder;
pub mod registry;
pub mod tunnel;

pub use registry::{Closable, DrainOutcome, EntryId, Registry};
pub use tunnel::{
    Tunnel, TunnelBuilder, TunnelState, DEFAULT_LOCAL_HOST, DEFAULT_MAX_CONNECTION_ATTEMPTS,
};
