//! Echo demo: several servers behind one in-memory bus.
//!
//! 1. Start `--servers` Echo servers, each with a different load
//! 2. Send `--requests` unary calls; the least loaded server should win
//!    every claim race
//! 3. Fan a Ping out to every server
//! 4. Open a Chat stream and exchange `--frames` lines
//! 5. Kill one server, shut the rest down gracefully

mod stub;
mod tap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use busrpc::core::wire::protocol_registry;
use busrpc::prelude::*;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use stub::{ChatLine, EchoClient, EchoRequest, EchoResponse, EchoServer, EchoService, Ping, Pong};
use tap::TracingBus;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "busrpc-echo-demo")]
#[command(about = "Claim-based routing, fan-out and streams over an in-memory bus")]
struct Cli {
    /// Number of Echo servers
    #[arg(short, long, default_value = "3")]
    servers: usize,

    /// Unary Echo calls to make
    #[arg(short, long, default_value = "5")]
    requests: usize,

    /// Lines to exchange over the Chat stream
    #[arg(short, long, default_value = "3")]
    frames: usize,

    /// JSON file with `server`, `client` and `selection` sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for request, stream and node ids
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    server: ServerConfig,
    client: ClientConfig,
    selection: Option<SelectionConfig>,
}

fn load_config(path: Option<&PathBuf>) -> Result<DemoConfig> {
    let Some(path) = path else {
        return Ok(DemoConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Echo server that reports a fixed load.
struct EchoNode {
    name: String,
    load: f32,
}

#[async_trait]
impl EchoService for EchoNode {
    async fn echo(&self, req: EchoRequest) -> RpcResult<EchoResponse> {
        if req.text.is_empty() {
            return Err(RpcError::new(ErrorCode::InvalidArgument, "nothing to echo"));
        }
        Ok(EchoResponse {
            text: req.text.to_uppercase(),
            served_by: self.name.clone(),
        })
    }

    fn echo_affinity(&self, _req: &EchoRequest) -> f32 {
        1.0 - self.load
    }

    async fn ping(&self, req: Ping) -> RpcResult<Pong> {
        Ok(Pong {
            seq: req.seq,
            server: self.name.clone(),
        })
    }

    async fn chat(&self, stream: Stream<ChatLine, ChatLine>) -> RpcResult<()> {
        loop {
            let line = match stream.recv().await {
                Ok(line) => line,
                Err(RpcError::StreamClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let reply: String = line.text.chars().rev().collect();
            stream
                .send(&ChatLine {
                    text: format!("{} says {reply}", self.name),
                })
                .await?;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    anyhow::ensure!(cli.servers > 0, "need at least one server");

    let ids = Arc::new(match cli.seed {
        Some(seed) => IdGenerator::with_seed(seed),
        None => IdGenerator::new(),
    });
    let tap = Arc::new(TracingBus::new(InMemoryBus::new(), protocol_registry()));
    let bus: Arc<dyn MessageBus> = tap.clone();

    println!("── Starting {} servers ─────────────────────────────", cli.servers);
    let mut servers = Vec::with_capacity(cli.servers);
    for i in 0..cli.servers {
        let node = Arc::new(EchoNode {
            name: format!("echo-{i}"),
            load: (i as f32 + 1.0) / (cli.servers as f32 + 1.0),
        });
        let load = node.load;
        let server = EchoServer::new(node, bus.clone(), config.server.clone(), ids.clone()).await?;
        println!("  echo-{i}  id={}  load={load:.2}", server.id());
        servers.push(server);
    }

    let client = EchoClient::new(bus.clone(), config.client.clone().with_streams(), ids.clone()).await?;
    let opts = match &config.selection {
        Some(selection) => RequestOptions::new().with_selection(selection.clone()),
        None => RequestOptions::new(),
    };

    println!();
    println!("── Unary Echo ({} calls) ───────────────────────────", cli.requests);
    for n in 0..cli.requests {
        let started = Instant::now();
        let req = EchoRequest {
            text: format!("hello #{n}"),
        };
        match client.echo(&req, opts.clone()).await {
            Ok(res) => println!(
                "  {:<10} -> {:<10} by {}  ({:?})",
                req.text,
                res.text,
                res.served_by,
                started.elapsed()
            ),
            Err(e) => println!("  {:<10} failed: {e}", req.text),
        }
    }
    let empty = client.echo(&EchoRequest { text: String::new() }, opts.clone()).await;
    println!("  <empty>    -> {:?}", empty.map(|r| r.text));

    println!();
    println!("── Fan-out Ping ───────────────────────────────────");
    let pongs = client.ping(&Ping { seq: 1 }, opts.clone()).await?;
    for pong in &pongs {
        match &pong.result {
            Ok(p) => println!("  pong seq={} from {} ({})", p.seq, p.server, pong.server_id),
            Err(e) => println!("  error from {}: {e}", pong.server_id),
        }
    }
    println!("  {} of {} servers answered", pongs.len(), cli.servers);

    println!();
    println!("── Chat stream ({} frames) ─────────────────────────", cli.frames);
    let chat = client.chat(opts.clone()).await?;
    info!(stream_id = chat.stream_id(), "chat open");
    for n in 0..cli.frames {
        chat.send(&ChatLine {
            text: format!("line {n}"),
        })
        .await?;
        let reply = chat.recv().await?;
        println!("  line {n} -> {}", reply.text);
    }
    chat.close(None).await?;

    println!();
    println!("── Shutdown ───────────────────────────────────────");
    client.close().await;
    let (first, rest) = servers.split_at(1);
    first[0].kill().await;
    println!("  killed {}", first[0].id());
    for server in rest {
        server.shutdown().await;
        println!("  drained {}", server.id());
    }
    println!("  {} publishes of unregistered types", tap.unknown());

    Ok(())
}
