//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--addr 127.0.0.1:40000] [--name Player] [--keymap keymap.cfg]
//!
//! There is no real input device wired up in this harness; movement is
//! driven entirely through the console (`press <button>` / `release
//! <button>`) so the binary stays useful for manual smoke testing.
//!
//! Console commands:
//!   press <button>   - Hold a named button down (e.g. `press forward`)
//!   release <button> - Release a previously pressed button
//!   pos              - Print the predicted position/yaw of our own pawn
//!   quit             - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_client::input::InputSampler;
use engine_client::GameClient;
use engine_shared::config::EngineConfig;
use engine_shared::keymap::Keymap;
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
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--keymap" if i + 1 < args.len() => {
                cfg.keymap_path = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

fn load_keymap(path: &str) -> Keymap {
    match std::fs::read_to_string(path) {
        Ok(text) => match Keymap::parse(&text) {
            Ok(keymap) => keymap,
            Err(err) => {
                tracing::warn!(%path, error = %err, "malformed keymap, using defaults");
                Keymap::default()
            }
        },
        Err(_) => Keymap::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(server = %cfg.server_addr, name = %cfg.player_name, "starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    info!(addr = ?client.local_addr(), "connected to server");

    let mut sampler = InputSampler::new(load_keymap(&cfg.keymap_path));

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

    println!("Client connected. Type 'press <button>'/'release <button>' to move, 'pos' to inspect, 'quit' to exit.");
    println!();

    let tick_interval = cfg.tick_duration();
    let mut next_tick = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                client.disconnect().await?;
                info!("disconnected");
                return Ok(());
            }
            let mut parts = line.splitn(2, ' ');
            let handled = match parts.next().unwrap_or("") {
                "press" => {
                    if let Some(button) = parts.next() {
                        sampler.press(button);
                    }
                    true
                }
                "release" => {
                    if let Some(button) = parts.next() {
                        sampler.release(button);
                    }
                    true
                }
                "pos" => {
                    let (pos, yaw) = client.predicted_pose();
                    println!("pos=({:.2}, {:.2}, {:.2}) yaw={:.2}", pos.x, pos.y, pos.z, yaw);
                    true
                }
                _ => false,
            };
            if !handled {
                match client.exec_console(&line) {
                    Ok(output) => {
                        for line in output {
                            println!("{line}");
                        }
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
        }

        client.pump_network().await?;
        client.tick(sampler.sample()).await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
