//! Interactive overlay node.
//!
//! Binds a UDP port (retrying on incremented ports), joins the overlay via
//! the configured entry nodes, then reads commands from stdin:
//!
//! - `@<hex-id> <text>` - direct message to the peer with that id prefix
//! - `info` - print the local identity and routing table
//! - `shutdown` - broadcast a shutdown request and exit
//! - `exit` - leave the overlay and exit
//! - anything else - broadcast to the whole overlay

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use peernet::{NetError, Peer, PeerId, PeerNode, UdpTransport};

/// How many incremented ports to try when the requested one is taken.
const BIND_ATTEMPTS: u16 = 1024;
/// Consecutive entry ports probed per configured entry endpoint.
const ENTRY_PORT_SPAN: u16 = 10;

#[derive(Parser)]
#[command(name = "peernet")]
#[command(about = "Self-organizing peer-to-peer overlay node")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Port to listen on (incremented until a free one is found)
    #[arg(short, long, default_value_t = 2000)]
    port: u16,

    /// Entry node as host:port (repeatable)
    #[arg(short, long)]
    entry: Vec<String>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn bind_first_free(addr: IpAddr, base_port: u16) -> Result<UdpTransport, NetError> {
    for offset in 0..BIND_ATTEMPTS {
        let port = base_port.wrapping_add(offset);
        match UdpTransport::bind(addr, port).await {
            Ok(transport) => return Ok(transport),
            Err(err) if offset + 1 == BIND_ATTEMPTS => return Err(err),
            Err(_) => {}
        }
    }
    unreachable!("bind loop always returns")
}

async fn resolve_entry_nodes(entries: &[String], default_port: u16) -> Vec<SocketAddr> {
    let mut resolved = Vec::new();
    let specs: Vec<String> = if entries.is_empty() {
        vec![format!("127.0.0.1:{}", default_port)]
    } else {
        entries.to_vec()
    };

    for spec in specs {
        match tokio::net::lookup_host(spec.as_str()).await {
            Ok(addrs) => {
                if let Some(addr) = addrs.into_iter().next() {
                    // Probe a span of consecutive ports so nodes started
                    // with the same base port still find each other. The
                    // span is clipped at the top of the port range.
                    for offset in 0..ENTRY_PORT_SPAN {
                        match addr.port().checked_add(offset) {
                            Some(port) => resolved.push(SocketAddr::new(addr.ip(), port)),
                            None => break,
                        }
                    }
                }
            }
            Err(err) => warn!("failed to resolve entry node {}: {}", spec, err),
        }
    }
    resolved
}

fn print_info(peers: &[Peer]) {
    let local = &peers[0];
    println!("local:\n{} {} {}", local.id, local.addr.ip(), local.addr.port());
    println!("{} peer(s):", peers.len() - 1);
    for peer in &peers[1..] {
        println!("{} {} {}", peer.id, peer.addr.ip(), peer.addr.port());
    }
}

fn short_id(id: &PeerId) -> String {
    id.to_string()[..4].to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_max_level(level).finish())?;

    let transport = bind_first_free(cli.listen, cli.port).await?;
    let entry_nodes = resolve_entry_nodes(&cli.entry, cli.port).await;
    let node = Arc::new(PeerNode::new(transport, entry_nodes)?);

    // Join strictly before the receive loop starts consuming datagrams.
    if let Err(err) = node.join().await {
        warn!("join failed: {} (running standalone)", err);
    }

    let runner = node.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    let printer = node.clone();
    let mut deliveries = node.subscribe();
    tokio::spawn(async move {
        while let Ok(delivery) = deliveries.recv().await {
            if delivery.text == "shutdown" {
                printer.disconnect().await.ok();
                printer.stop();
                break;
            }
            println!("{}: {}", short_id(&delivery.source), delivery.text);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                match line.as_str() {
                    "" => {}
                    "exit" => break,
                    "shutdown" => {
                        node.broadcast("shutdown").await.ok();
                        break;
                    }
                    "info" => print_info(&node.peers()),
                    _ => {
                        if let Some(rest) = line.strip_prefix('@') {
                            let (prefix, text) = rest.split_once(' ').unwrap_or((rest, ""));
                            let destination = PeerId::from_hex_prefix(prefix);
                            node.send(text, destination).await.ok();
                        } else {
                            node.broadcast(&line).await.ok();
                        }
                    }
                }
            }
        }
    }

    node.disconnect().await.ok();
    node.stop();
    run_task.await??;
    Ok(())
}
