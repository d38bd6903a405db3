//! Common test utilities: an in-memory transport and log capture.
#![allow(dead_code)]

use async_trait::async_trait;
use ssh_tunnel::{Dialer, Endpoint, Logger, Result, TransportClient, Tunnel, TunnelError};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a fmt subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
pub struct Counters {
    pub dials: Arc<AtomicUsize>,
    pub channels: Arc<AtomicUsize>,
    pub client_closes: Arc<AtomicUsize>,
}

impl Counters {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    pub fn client_closes(&self) -> usize {
        self.client_closes.load(Ordering::SeqCst)
    }
}

/// A dialer whose "remote" ends are handed to the test through a channel.
pub struct StubDialer {
    counters: Counters,
    fail_first: usize,
    fail_channel: bool,
    remote_tx: mpsc::UnboundedSender<DuplexStream>,
}

impl StubDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let dialer = Self {
            counters: Counters::default(),
            fail_first: 0,
            fail_channel: false,
            remote_tx,
        };
        (dialer, remote_rx)
    }

    /// Refuse the first `n` dials.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(usize::MAX)
    }

    pub fn failing_channel(mut self) -> Self {
        self.fail_channel = true;
        self
    }

    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }
}

#[async_trait]
impl Dialer for StubDialer {
    type Client = StubClient;

    async fn dial(&self, server: &Endpoint) -> Result<StubClient> {
        let attempt = self.counters.dials.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(TunnelError::Connection(format!("stub refused {}", server)));
        }
        Ok(StubClient {
            counters: self.counters.clone(),
            fail_channel: self.fail_channel,
            remote_tx: self.remote_tx.clone(),
        })
    }
}

pub struct StubClient {
    counters: Counters,
    fail_channel: bool,
    remote_tx: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl TransportClient for StubClient {
    type Stream = DuplexStream;

    async fn open_channel(&self, remote: &Endpoint) -> Result<DuplexStream> {
        if self.fail_channel {
            return Err(TunnelError::Channel(format!("stub cannot reach {}", remote)));
        }
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.counters.channels.fetch_add(1, Ordering::SeqCst);
        let _ = self.remote_tx.send(far);
        Ok(near)
    }

    async fn close(&self) -> Result<()> {
        self.counters.client_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects every message a tunnel logs.
#[derive(Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<String>>>);

impl CapturedLog {
    pub fn logger(&self) -> impl Logger + 'static {
        let lines = self.0.clone();
        move |args: fmt::Arguments<'_>| lines.lock().unwrap().push(args.to_string())
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

/// A tunnel on 127.0.0.1 backed by `dialer`.
pub fn stub_tunnel(dialer: StubDialer, attempts: u32, log: &CapturedLog) -> Tunnel<StubDialer> {
    Tunnel::builder(Endpoint::new("jump.test", 0), Endpoint::new("db.test", 5432))
        .local_host("127.0.0.1")
        .max_connection_attempts(attempts)
        .logger(log.logger())
        .build_with_dialer(dialer)
}

/// Listen and run `serve` in the background.
pub async fn start(tunnel: &Tunnel<StubDialer>) -> JoinHandle<Result<()>> {
    let listener = tunnel.listen().await.expect("listen should succeed");
    let serving = tunnel.clone();
    tokio::spawn(async move { serving.serve(listener).await })
}

/// Wait for `serve` to return and unwrap its result.
pub async fn finish(handle: JoinHandle<Result<()>>) {
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("serve did not return in time")
        .expect("serve task panicked")
        .expect("serve returned an error");
}

/// Poll `condition` until it holds or the test timeout expires.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
