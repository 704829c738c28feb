// src/main.rs

//! A self-contained demo: an echo server and a client session talking over
//! the in-process loopback transport.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tether::config::Config;
use tether::core::executor::{Executor, ThreadPool};
use tether::core::message::Message;
use tether::core::metrics::gather_metrics;
use tether::core::pipeline::{
    HeaderAction, HeaderHandler, RequestHeader, RequestVec, ResponseVec, ServiceOps, SyncHandler,
};
use tether::server::Server;
use tether::session::{Session, SessionKind};
use tether::transport::{LoopbackTransport, Transport};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

const CALLS: usize = 8;

struct Echo;

impl HeaderHandler for Echo {
    fn process_header(&self, _header: &RequestHeader<'_>) -> Result<HeaderAction> {
        Ok(HeaderAction::Inline)
    }
}

impl SyncHandler for Echo {
    fn process(&self, request: &RequestVec<'_>, response: &mut ResponseVec) -> Result<()> {
        response.head = Bytes::copy_from_slice(request.head);
        response.body = vec![Bytes::from(request.to_vec())];
        Ok(())
    }
}

fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("tether version {VERSION}");
        return Ok(());
    }

    // Without --config the built-in defaults are used.
    let config = match args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
    {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let json = args.contains(&"--json".to_string());
    if let Err(e) = run_demo(&config, json) {
        error!("Demo failed: {e:#}");
        return Err(e);
    }
    Ok(())
}

fn run_demo(config: &Config, json: bool) -> Result<()> {
    info!("Starting tether {} demo.", env!("CARGO_PKG_VERSION"));
    let pool = Arc::new(ThreadPool::new(&config.executor).context("Failed to start thread pool")?);
    let executor: Arc<dyn Executor> = pool.clone();
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());

    let echo = Arc::new(Echo);
    let ops = ServiceOps::new().with_header(echo.clone()).with_sync(echo);
    let server = Server::new(transport.clone(), executor.clone(), config, ops);
    server
        .bind(&config.server.endpoint)
        .with_context(|| format!("Failed to bind {}", config.server.endpoint))?;

    let session = Session::builder(SessionKind::Client, transport, executor)
        .config(config.session.clone())
        .endpoint(config.server.endpoint.clone())
        .build()?;
    let timeout = config.session.conn_timeout;
    session.connect(timeout).context("Failed to connect")?;

    for i in 0..CALLS {
        let payload = format!("ping {i}");
        let response = session.call(
            Message::request(Bytes::from_static(b"echo"), vec![Bytes::from(payload.clone())]),
            timeout,
        )?;
        let echoed = response.flatten_body();
        info!(
            "Call {i}: sent {payload:?}, got {:?}.",
            String::from_utf8_lossy(&echoed)
        );
    }

    if let Some(report) = session.dump_status() {
        if json {
            let rendered =
                serde_json::to_string_pretty(&report).context("Failed to render status")?;
            println!("{rendered}");
        } else {
            println!("{report}");
        }
    }
    println!("{}", gather_metrics());

    let shutdown = Duration::from_secs(5);
    session.destroy(shutdown)?;
    server.destroy(shutdown);
    pool.shutdown();
    info!("Demo finished.");
    Ok(())
}
