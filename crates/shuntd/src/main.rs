//! shuntd — the record/replay proxy daemon.
//!
//! Single binary that assembles the proxy core:
//! - Parser registry (mongo, grpc, postgres, redis, http, kafka, generic)
//! - Dispatcher sessions, one per accepted connection
//! - JSON-lines mock persistence (record) / store loading (replay)
//!
//! # Usage
//!
//! ```text
//! shuntd record --listen 127.0.0.1:16789 --dest 127.0.0.1:27017 --out mocks.jsonl
//! shuntd replay --listen 127.0.0.1:16789 --mocks mocks.jsonl
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shunt_core::context::ConditionalDstCfg;
use shunt_core::mock::Mock;
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::{ParserRegistry, ProxyMode, Session};
use shunt_store::MockStore;

#[derive(Parser)]
#[command(name = "shuntd", about = "Record/replay proxy for outbound dependencies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record outbound traffic: forward to the real destination and
    /// persist every exchange as a mock.
    Record {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:16789")]
        listen: SocketAddr,

        /// The real destination (`host:port`).
        #[arg(long)]
        dest: String,

        /// File the recorded mocks are appended to (JSON lines).
        #[arg(long, default_value = "mocks.jsonl")]
        out: PathBuf,

        /// Destination ports that pass through untouched.
        #[arg(long = "passthrough-port")]
        passthrough_ports: Vec<u32>,

        /// Forward without recording anything.
        #[arg(long)]
        disable_outgoing: bool,

        /// Advisory peek buffer size hint.
        #[arg(long)]
        mtu: Option<usize>,
    },
    /// Replay recorded mocks: serve intercepted connections entirely
    /// from the store.
    Replay {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:16789")]
        listen: SocketAddr,

        /// Mock file to load (JSON lines).
        #[arg(long, default_value = "mocks.jsonl")]
        mocks: PathBuf,

        /// Password for the MongoDB SCRAM rewrite.
        #[arg(long)]
        mongo_password: Option<String>,

        /// Optional real destination for passthrough policies.
        #[arg(long)]
        dest: Option<String>,

        /// Destination ports that pass through untouched.
        #[arg(long = "passthrough-port")]
        passthrough_ports: Vec<u32>,

        /// Disable fuzzy matching; only exact matches are served.
        #[arg(long)]
        no_fuzzy: bool,

        /// Cap on concurrent HTTP/2 streams per gRPC connection.
        #[arg(long)]
        max_grpc_streams: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shuntd=debug,shunt=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Record {
            listen,
            dest,
            out,
            passthrough_ports,
            disable_outgoing,
            mtu,
        } => {
            let opts = Options {
                outgoing_disabled: disable_outgoing,
                passthrough_ports: passthrough_ports.into_iter().collect::<HashSet<_>>(),
                mtu,
                ..Default::default()
            };
            run_record(listen, parse_dest(&dest)?, out, opts).await
        }
        Command::Replay {
            listen,
            mocks,
            mongo_password,
            dest,
            passthrough_ports,
            no_fuzzy,
            max_grpc_streams,
        } => {
            let opts = Options {
                mongo_password,
                passthrough_ports: passthrough_ports.into_iter().collect::<HashSet<_>>(),
                fuzzy_enabled: !no_fuzzy,
                max_grpc_streams,
                ..Default::default()
            };
            let dest = dest.as_deref().map(parse_dest).transpose()?;
            run_replay(listen, mocks, dest, opts).await
        }
    }
}

fn parse_dest(dest: &str) -> anyhow::Result<ConditionalDstCfg> {
    let (host, port) = dest
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("destination must be host:port, got {dest:?}"))?;
    Ok(ConditionalDstCfg::new(host, port.parse()?))
}

fn build_registry() -> ParserRegistry {
    let mut registry = ParserRegistry::new();
    registry.register(Arc::new(shunt_mongo::MongoParser));
    registry.register(Arc::new(shunt_grpc::GrpcParser));
    registry.register(Arc::new(shunt_postgres::PostgresParser));
    registry.register(Arc::new(shunt_redis::RedisParser));
    registry.register(Arc::new(shunt_http::HttpParser));
    registry.register(Arc::new(shunt_generic::KafkaParser));
    registry.register(Arc::new(shunt_generic::GenericParser));
    registry
}

async fn run_record(
    listen: SocketAddr,
    dest: ConditionalDstCfg,
    out: PathBuf,
    opts: Options,
) -> anyhow::Result<()> {
    let registry = Arc::new(build_registry());
    let session = Arc::new(Session::new(registry, Arc::new(opts)));
    let (sink, mut rx) = MockSink::channel(256);

    // Mock writer: one JSON line per recorded exchange.
    let writer = tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(path = ?out, "cannot open mock file: {e}");
                return;
            }
        };
        let mut written = 0usize;
        while let Some(mock) = rx.recv().await {
            match serde_json::to_string(&mock) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!("mock write failed: {e}");
                        return;
                    }
                    written += 1;
                }
                Err(e) => warn!("mock serialization failed: {e}"),
            }
        }
        let _ = file.flush().await;
        info!(written, "mock writer finished");
    });

    let root = CancellationToken::new();
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, dest = %dest.endpoint(), "recording");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let session = Arc::clone(&session);
                let mode = ProxyMode::Record { dest: dest.clone(), sink: sink.clone() };
                let token = root.child_token();
                tokio::spawn(async move {
                    if let Err(e) = session
                        .handle(Box::new(socket), peer.ip().to_string(), mode, token)
                        .await
                    {
                        error!(%peer, "session failed: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    root.cancel();
    drop(sink);
    writer.await?;
    Ok(())
}

async fn run_replay(
    listen: SocketAddr,
    mocks: PathBuf,
    dest: Option<ConditionalDstCfg>,
    opts: Options,
) -> anyhow::Result<()> {
    let store = Arc::new(MockStore::new());
    let loaded = load_mocks(&mocks).await?;
    info!(count = loaded.len(), path = ?mocks, "mocks loaded");
    store.load(loaded)?;

    let registry = Arc::new(build_registry());
    let session = Arc::new(Session::new(registry, Arc::new(opts)));
    let root = CancellationToken::new();
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "replaying");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let session = Arc::clone(&session);
                let mode = ProxyMode::Replay { store: Arc::clone(&store), dest: dest.clone() };
                let token = root.child_token();
                tokio::spawn(async move {
                    if let Err(e) = session
                        .handle(Box::new(socket), peer.ip().to_string(), mode, token)
                        .await
                    {
                        error!(%peer, "session failed: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(
        remaining_filtered = store.filtered_len(),
        used = store.used_names().len(),
        "shutting down"
    );
    root.cancel();
    Ok(())
}

async fn load_mocks(path: &PathBuf) -> anyhow::Result<Vec<Mock>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut mocks = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mock: Mock = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {e}", path.display(), lineno + 1))?;
        mocks.push(mock);
    }
    Ok(mocks)
}
