// File: common/mod.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use slitscan::config::ScanConfig;
use slitscan::engine::Engine;
use slitscan::events::EventSink;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub fn test_config(dir: &TempDir, max_probes: usize, deadline: Duration) -> ScanConfig {
    ScanConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        callback_addr: None,
        fifo_path: dir.path().join("harvest.fifo"),
        log_path: Some(dir.path().join("scan.log")),
        max_probes,
        probe_deadline: deadline,
        poll_timeout: Duration::from_millis(20),
        json: false,
    }
}

pub fn engine_with(dir: &TempDir, max_probes: usize, deadline: Duration) -> Engine {
    let config = test_config(dir, max_probes, deadline);
    let sink = EventSink::new(false, config.log_path.as_deref()).unwrap();
    Engine::new(config, sink).unwrap()
}

pub fn test_engine(dir: &TempDir) -> Engine {
    engine_with(dir, 8, Duration::from_secs(45))
}

/// Write side of the engine's harvest FIFO.
pub fn fifo_writer(engine: &Engine) -> File {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(engine.fifo_path())
        .unwrap()
}

/// Runs engine iterations until `done` holds or the deadline passes.
pub fn drive<F>(engine: &mut Engine, timeout: Duration, done: F) -> bool
where
    F: Fn(&Engine) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        engine.turn().unwrap();
        if done(engine) {
            return true;
        }
    }
    false
}

pub fn read_log(dir: &TempDir) -> String {
    fs::read_to_string(dir.path().join("scan.log")).unwrap_or_default()
}
