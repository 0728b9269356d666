//! Terminal front end: create or join a room, then chat line by line.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use execp2p_core::application::AppEvent;
use execp2p_core::{Config, Session};

/// A post-quantum end-to-end encrypted P2P chat.
#[derive(Parser, Debug)]
#[command(name = "execp2p", version)]
struct Cli {
    /// Log level (debug, info, warn, error). Overrides $EXECP2P_LOG_LEVEL.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Room ID to join; omit to create a new room.
    #[arg(long)]
    join: Option<String>,

    /// Access key for the room being joined.
    #[arg(long, requires = "join")]
    key: Option<String>,

    /// Direct host:port of the room's creator, bypassing discovery.
    #[arg(long, requires = "join")]
    addr: Option<String>,

    /// Signalling server URL for NAT traversal (optional).
    #[arg(long)]
    signaling_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let mut config = Config::default();
    config.discovery.signaling_server = cli.signaling_url.clone();

    let session = Session::new(config).context("session setup failed")?;
    let mut events = session.events().subscribe();

    match &cli.join {
        None => {
            let created = session.create_room().await.context("room creation failed")?;
            println!("room created");
            println!("  room id:    {}", created.room_id);
            println!("  access key: {}", created.access_key);
            println!("  port:       {}", created.listen_port);
            println!("share the room id and access key; waiting for a peer...");
        }
        Some(room_id) => {
            let key = cli.key.clone().unwrap_or_default();
            println!("joining {room_id}...");
            session
                .join_room(room_id, cli.addr.as_deref(), &key)
                .await
                .context("join failed")?;
            println!("connected; say hello");
        }
    }

    // Event printer.
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AppEvent::MessageReceived(payload)) => {
                    println!("[{}] {}", &payload.sender_id[..8], payload.message);
                }
                Ok(AppEvent::SecurityMessage(msg)) => println!("* {msg}"),
                Ok(AppEvent::PeerFingerprints(fps)) => {
                    for (peer, fp) in fps {
                        println!("* fingerprint {}: {}", &peer[..8], fp);
                    }
                }
                Ok(AppEvent::NetworkError(err)) => eprintln!("! {err}"),
                Ok(AppEvent::RoomLeft) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event printer lagged by {n} events");
                }
                Err(_) => break,
            }
        }
    });

    // Stdin chat loop. `/quit` leaves the room.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.trim() == "/status" => {
                    let status = session.network_status();
                    println!(
                        "* room {} | peers {} | verified {} | e2e {}",
                        status.room_id, status.connected_peers,
                        status.verified_peers, status.e2e_encryption
                    );
                }
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = session.send_message(line.trim()).await {
                        eprintln!("! send failed: {e}");
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    session.close().await;
    // Give the close frame a moment on the wire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    printer.abort();
    Ok(())
}

fn init_logging(cli_level: Option<&str>) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env("EXECP2P_LOG_LEVEL")
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
