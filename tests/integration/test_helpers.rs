// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether::config::Config;
use tether::core::executor::{Executor, ThreadPool};
use tether::core::pipeline::{
    HeaderAction, HeaderHandler, OneWayDispatch, OneWayHandler, RequestHeader, RequestVec,
    ResponseVec, ServiceOps, SyncHandler,
};
use tether::server::Server;
use tether::session::{Session, SessionKind};
use tether::transport::{LoopbackTransport, Transport};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static NEXT_ENDPOINT: AtomicUsize = AtomicUsize::new(1);

/// Installs a quiet subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A config tuned for tests: no pinning, short timeouts, fast backoff.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.affinity.enabled = false;
    config.executor.max_threads = 64;
    config.session.connections = 2;
    config.session.conn_timeout = Duration::from_secs(3);
    config.session.reconnect_interval = Duration::from_millis(50);
    config.session.disconnect_timeout = Duration::from_secs(2);
    config.session.rebuild.max_attempts = 2;
    config.session.rebuild.backoff = Duration::from_millis(300);
    config.server.workers = 1;
    config
}

/// A transport, an executor, and a config shared by one test.
pub struct Harness {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub loopback: LoopbackTransport,
    pub pool: Arc<ThreadPool>,
    pub executor: Arc<dyn Executor>,
    pub endpoint: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let loopback = LoopbackTransport::new();
        let pool = Arc::new(ThreadPool::new(&config.executor).expect("thread pool"));
        let executor: Arc<dyn Executor> = pool.clone();
        let endpoint = format!(
            "loopback://test-{}",
            NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            config,
            transport: Arc::new(loopback.clone()),
            loopback,
            pool,
            executor,
            endpoint,
        }
    }

    /// A server bound to this harness's endpoint.
    pub fn server(&self, ops: ServiceOps) -> Server {
        let server = Server::new(
            self.transport.clone(),
            self.executor.clone(),
            &self.config,
            ops,
        );
        server.bind(&self.endpoint).expect("bind");
        server
    }

    /// An unconnected client session towards this harness's endpoint.
    pub fn client(&self) -> Session {
        Session::builder(
            SessionKind::Client,
            self.transport.clone(),
            self.executor.clone(),
        )
        .config(self.config.session.clone())
        .endpoint(self.endpoint.clone())
        .build()
        .expect("client session")
    }
}

/// Echoes the request head and body; counts calls.
#[derive(Default)]
pub struct Echo {
    pub requests: AtomicUsize,
    pub oneways: AtomicUsize,
}

impl HeaderHandler for Echo {
    fn process_header(&self, _header: &RequestHeader<'_>) -> Result<HeaderAction> {
        Ok(HeaderAction::Inline)
    }
}

impl SyncHandler for Echo {
    fn process(&self, request: &RequestVec<'_>, response: &mut ResponseVec) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        response.head = Bytes::copy_from_slice(request.head);
        response.body = vec![Bytes::from(request.to_vec())];
        Ok(())
    }
}

impl OneWayHandler for Echo {
    fn process_oneway(&self, _message: &RequestVec<'_>) -> Result<()> {
        self.oneways.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An echo callback set and the handler behind it.
pub fn echo_ops() -> (ServiceOps, Arc<Echo>) {
    let echo = Arc::new(Echo::default());
    let ops = ServiceOps::new()
        .with_header(echo.clone())
        .with_sync(echo.clone())
        .with_oneway(OneWayDispatch::Inline(echo.clone()));
    (ops, echo)
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
