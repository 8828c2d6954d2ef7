//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--addr 127.0.0.1:40000] [--tick-hz 64] [--max-players 8]
//!
//! Console commands:
//!   status          - List connected peers
//!   kick <addr>     - Disconnect a peer by socket address
//!   quit            - Shut down the server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_server::GameServer;
use engine_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--max-players" if i + 1 < args.len() => {
                cfg.max_players = args[i + 1].parse().unwrap_or(cfg.max_players);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, max_players = cfg.max_players, "starting server");

    let mut server = GameServer::bind(&cfg).await.context("bind server")?;
    let local = server.local_addr()?;
    info!(%local, "server listening");

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'kick <addr>' to disconnect a peer, 'quit' to exit.");
    println!();

    let tick_interval = cfg.tick_duration();
    let mut next_tick = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                info!("shutting down");
                return Ok(());
            }
            match server.exec_console(&line) {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        }

        server.step().await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
