//! PeerLink daemon: LAN chat over the session engine.
//!
//! Lines read from stdin are broadcast to every connected peer; incoming
//! messages are printed with the sender's announced name.

mod config;
mod transport;

use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use peerlink_core::{Engine, Event, SendOptions};

use transport::PosixTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerlink {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let transport = PosixTransport::bind(&cfg).context("binding sockets")?;
    let mut engine = Engine::new(cfg.engine_config());
    engine.start_discovery()?;
    engine.start_listening();
    info!(name = %cfg.name, version = VERSION, "peerlink up");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, engine, transport))
}

async fn run(
    cfg: config::Config,
    mut engine: Engine,
    mut transport: PosixTransport,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.tick_ms.max(1)));
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(text)) if !text.trim().is_empty() => {
                        let sent = engine.broadcast(text.as_bytes(), SendOptions::default());
                        if sent == 0 {
                            println!("(no connected peers)");
                        }
                    }
                    Ok(Some(_)) => {}
                    // Stdin closed: keep servicing the engine.
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = tick.tick() => {
                let now = start.elapsed().as_millis() as u64;
                engine.service(&mut transport, now);
                while let Some(ev) = engine.poll_event() {
                    handle_event(&cfg, &mut engine, &mut transport, ev, now);
                }
            }
        }
    }

    info!("shutting down");
    engine.shutdown(&mut transport)?;
    Ok(())
}

fn handle_event(
    cfg: &config::Config,
    engine: &mut Engine,
    transport: &mut PosixTransport,
    ev: Event,
    now_ms: u64,
) {
    match ev {
        Event::PeerDiscovered { peer } => {
            let name = engine.peer_name(peer).unwrap_or("?").to_string();
            info!(%peer, name, "discovered");
            if cfg.auto_connect {
                if let Err(err) = engine.connect(transport, peer, now_ms) {
                    warn!(%peer, %err, "connect failed");
                }
            }
        }
        Event::PeerConnected { peer } => {
            let name = engine.peer_name(peer).unwrap_or("?").to_string();
            println!("* {name} joined");
        }
        Event::PeerDisconnected { peer } => {
            let name = engine.peer_name(peer).unwrap_or("?").to_string();
            println!("* {name} left");
        }
        Event::PeerFailed { peer } => {
            warn!(%peer, "connection failed");
        }
        Event::PeerLost { peer } => {
            info!(%peer, "lost");
        }
        Event::MessageReady { peer } => {
            let name = engine.peer_name(peer).unwrap_or("?").to_string();
            while let Ok(Some(msg)) = engine.recv(peer) {
                println!("<{name}> {}", String::from_utf8_lossy(&msg));
            }
        }
        Event::DatagramReceived { peer, payload } => {
            let name = peer
                .and_then(|p| engine.peer_name(p))
                .unwrap_or("?")
                .to_string();
            println!("<{name}/dgram> {}", String::from_utf8_lossy(&payload));
        }
        Event::CapabilityUpdated { peer } => {
            if let Some(max) = engine.effective_max(peer) {
                info!(%peer, max, "capabilities updated");
            }
        }
        Event::TransferComplete { peer, message_id } => {
            info!(%peer, message_id, "transfer complete");
        }
        Event::TransferCancelled { peer, message_id } => {
            warn!(%peer, message_id, "transfer cancelled");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
