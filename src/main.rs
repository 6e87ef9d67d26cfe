// File: main.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use anyhow::{Context, Result};
use clap::Parser;
use slitscan::cli::Cli;
use slitscan::engine::Engine;
use slitscan::events::EventSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.as_str()),
    )
    .init();

    let config = cli.to_config();
    let sink = EventSink::new(config.json, config.log_path.as_deref())
        .context("open log file")?;
    let mut engine = Engine::new(config.clone(), sink)?;

    println!("FIFO @ {}", engine.fifo_path().display());
    println!("Listening on {}", engine.local_addr().context("listener address")?);
    println!("Advertising {}", engine.callback_addr());
    match &config.log_path {
        Some(path) => println!("Logging to {}", path.display()),
        None => println!("Logging to stdout only"),
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("install interrupt handler")?;
    }

    engine.run(&running)?;

    let stats = engine.stats();
    println!(
        "{} harvested. {} attempts. {} open proxies. {} tunnels. {} failures. {} timeouts.",
        stats.harvested,
        stats.attempts,
        stats.plain_proxies,
        stats.tunnels,
        stats.failures,
        stats.timeouts
    );
    Ok(())
}
