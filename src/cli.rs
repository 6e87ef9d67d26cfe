// File: cli.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, ScanConfig};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[arg(
        short = 'l',
        long = "listen",
        default_value = config::DEFAULT_LISTEN,
        help = "Bind address for the connect-back listener"
    )]
    pub listen: SocketAddr,

    #[arg(
        short = 'c',
        long = "callback",
        help = "Address advertised to candidates in the CONNECT request (defaults to the bind address)"
    )]
    pub callback: Option<SocketAddr>,

    #[arg(
        short = 'f',
        long = "fifo",
        default_value = config::DEFAULT_FIFO,
        help = "Path of the harvest FIFO (created when missing)"
    )]
    pub fifo: PathBuf,

    #[arg(
        short = 'o',
        long = "log-file",
        default_value = config::DEFAULT_LOG,
        help = "Append-only result log"
    )]
    pub log_file: PathBuf,

    #[arg(
        long = "max-probes",
        default_value_t = config::MAX_PROBES,
        help = "Cap on simultaneously registered network probes"
    )]
    pub max_probes: usize,

    #[arg(
        long = "deadline",
        default_value_t = 45,
        help = "Probe inactivity deadline in seconds"
    )]
    pub deadline: u64,

    #[arg(long = "json", help = "Emit NDJSON events instead of plain text")]
    pub json: bool,

    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,

    #[arg(long = "no-color", help = "Disable colored output")]
    pub no_color: bool,
}

impl Cli {
    pub fn to_config(&self) -> ScanConfig {
        ScanConfig {
            listen_addr: self.listen,
            callback_addr: self.callback,
            fifo_path: self.fifo.clone(),
            log_path: Some(self.log_file.clone()),
            max_probes: self.max_probes,
            probe_deadline: Duration::from_secs(self.deadline),
            poll_timeout: config::POLL_TIMEOUT,
            json: self.json,
        }
    }
}
