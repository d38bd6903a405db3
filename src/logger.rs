//! The narrow logging capability the tunnel reports lifecycle events through.
//!
//! This is separate from the crate's own `tracing` instrumentation: a
//! `Logger` receives the human-readable lifecycle messages of one tunnel,
//! while `tracing` events carry structured fields for whoever installed a
//! subscriber. A tunnel without a logger drops its messages.

use std::fmt;

pub trait Logger: Send + Sync {
    fn log(&self, args: fmt::Arguments<'_>);
}

impl<F> Logger for F
where
    F: Fn(fmt::Arguments<'_>) + Send + Sync,
{
    fn log(&self, args: fmt::Arguments<'_>) {
        self(args)
    }
}

/// Forwards tunnel messages into `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "ssh_tunnel::tunnel", "{}", args);
    }
}
