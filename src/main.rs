use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanlink::discovery::DEFAULT_RENDEZVOUS;
use lanlink::{
    select_peer, send_envelope, CancellationToken, Discovery, DiscoveryConfig, Endpoint,
    JsonProtocol, MessageEnvelope, PeerAddr, PeerAddrInfo, PeerFeed, PeerSelection,
    JSON_PROTOCOL,
};

const DEFAULT_CONTENT: &str = "Hello, securely over libp2p QUIC!";

#[derive(Parser)]
#[clap(name = "lanlink")]
#[clap(about = "Find a peer on the local network and exchange an authenticated message")]
struct Args {
    /// Enable debug logging (RUST_LOG overrides)
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive messages until interrupted
    Receiver {
        /// Address to listen on; repeat for several sockets
        #[clap(long = "listen", default_value = "0.0.0.0:0")]
        listen: Vec<SocketAddr>,
        /// Do not announce on the local network
        #[clap(long)]
        no_discovery: bool,
        /// Discovery namespace shared with senders
        #[clap(long, default_value = DEFAULT_RENDEZVOUS)]
        rendezvous: String,
    },
    /// Send one message and exit
    Sender {
        /// Receiver address, e.g. /ip4/192.168.1.2/udp/4001/quic-v1/p2p/<peer-id>.
        /// Discovers a receiver when omitted.
        peer: Option<PeerAddr>,
        /// Message type
        #[clap(long = "type", default_value = "Greeting")]
        kind: String,
        /// Message content
        #[clap(long, default_value = DEFAULT_CONTENT)]
        content: String,
        /// Which discovered peer to use
        #[clap(long, value_enum, default_value_t = Select::First)]
        select: Select,
        /// Seconds to wait for an announcement
        #[clap(long, default_value = "30")]
        discovery_timeout: u64,
        /// Seconds to wait for the QUIC connection
        #[clap(long, default_value = "10")]
        connect_timeout: u64,
        /// Discovery namespace shared with receivers
        #[clap(long, default_value = DEFAULT_RENDEZVOUS)]
        rendezvous: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Select {
    /// The first announced peer
    First,
    /// The first announced peer that accepts a session
    Reachable,
}

impl From<Select> for PeerSelection {
    fn from(select: Select) -> Self {
        match select {
            Select::First => PeerSelection::First,
            Select::Reachable => PeerSelection::FirstReachable { max_attempts: 8 },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "lanlink=debug"
    } else {
        "lanlink=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            interrupt.cancel();
        }
    });

    match args.command {
        Command::Receiver {
            listen,
            no_discovery,
            rendezvous,
        } => run_receiver(&ctx, listen, no_discovery, rendezvous).await,
        Command::Sender {
            peer,
            kind,
            content,
            select,
            discovery_timeout,
            connect_timeout,
            rendezvous,
        } => {
            let envelope = MessageEnvelope::new(kind, content);
            let sender = SenderArgs {
                peer,
                selection: select.into(),
                discovery_timeout: Duration::from_secs(discovery_timeout),
                connect_timeout: Duration::from_secs(connect_timeout),
                rendezvous,
            };
            run_sender(&ctx, sender, envelope).await
        }
    }
}

async fn run_receiver(
    ctx: &CancellationToken,
    listen: Vec<SocketAddr>,
    no_discovery: bool,
    rendezvous: String,
) -> Result<()> {
    let endpoint = Endpoint::builder()
        .listen_addrs(listen)
        .bind()
        .await
        .context("failed to bind endpoint")?;
    let (protocol, mut incoming) = JsonProtocol::new();
    endpoint.register_handler(JSON_PROTOCOL, protocol)?;

    println!("🔐 Secure Receiver started. Peer ID: {}", endpoint.local_id());
    println!("Listening on:");
    for addr in endpoint.local_addrs() {
        println!("  {addr}");
    }

    let discovery = if no_discovery {
        None
    } else {
        match Discovery::start(&endpoint, DiscoveryConfig::new(rendezvous)).await {
            Ok((discovery, feed)) => {
                tokio::spawn(log_discoveries(feed));
                Some(discovery)
            }
            Err(e) => {
                warn!(error = %e, "discovery unavailable, reachable by explicit address only");
                None
            }
        }
    };

    loop {
        tokio::select! {
            _ = endpoint.run(ctx) => break,
            message = incoming.next() => match message {
                Some(message) => println!("✅ Secure Message Received: {}", message.envelope),
                None => break,
            },
        }
    }

    if let Some(discovery) = discovery {
        discovery.cancel();
    }
    endpoint.close().await;
    Ok(())
}

async fn log_discoveries(mut feed: PeerFeed) {
    while let Some(peer) = feed.next().await {
        info!(peer = %peer.id, addrs = ?peer.addrs, "Discovered new peer");
    }
}

struct SenderArgs {
    peer: Option<PeerAddr>,
    selection: PeerSelection,
    discovery_timeout: Duration,
    connect_timeout: Duration,
    rendezvous: String,
}

async fn run_sender(
    ctx: &CancellationToken,
    args: SenderArgs,
    envelope: MessageEnvelope,
) -> Result<()> {
    let endpoint = Endpoint::builder()
        .connect_timeout(args.connect_timeout)
        .bind()
        .await
        .context("failed to bind endpoint")?;

    let session = match args.peer {
        Some(addr) => endpoint
            .connect(ctx, &PeerAddrInfo::from(addr))
            .await
            .with_context(|| format!("failed to connect to {addr}"))?,
        None => {
            let (discovery, mut feed) =
                Discovery::start(&endpoint, DiscoveryConfig::new(args.rendezvous))
                    .await
                    .context("discovery failed; pass the receiver's address instead")?;
            println!("🔍 Waiting to discover peers...");
            let session = select_peer(
                &endpoint,
                ctx,
                &mut feed,
                &args.selection,
                args.discovery_timeout,
            )
            .await
            .context("no discovered peer could be reached")?;
            discovery.cancel();
            println!("Discovered peer: {}", session.remote_id());
            println!("🔐 Securely connected to discovered peer!");
            session
        }
    };

    send_envelope(&session, &envelope)
        .await
        .context("failed to send message")?;
    println!("✅ Secure Message Sent Successfully!");

    session.close();
    endpoint.close().await;
    Ok(())
}
