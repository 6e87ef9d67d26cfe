// File: config.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on simultaneously registered network probes. The listener and
/// the harvest pipe do not count against it.
pub const MAX_PROBES: usize = 128;

/// Coarse inactivity deadline for probes past INITIATED.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(45);

/// Ceiling on a single readiness wait.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_LISTEN: &str = "0.0.0.0:1234";
pub const DEFAULT_FIFO: &str = "harvest/harvest.fifo";
pub const DEFAULT_LOG: &str = "slitscan.log";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Bind address for the connect-back listener.
    pub listen_addr: SocketAddr,
    /// Address advertised inside the CONNECT request. Independent of the
    /// bind address; `None` advertises whatever the listener bound to.
    pub callback_addr: Option<SocketAddr>,
    pub fifo_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub max_probes: usize,
    pub probe_deadline: Duration,
    pub poll_timeout: Duration,
    pub json: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN.parse().unwrap(),
            callback_addr: None,
            fifo_path: PathBuf::from(DEFAULT_FIFO),
            log_path: Some(PathBuf::from(DEFAULT_LOG)),
            max_probes: MAX_PROBES,
            probe_deadline: PROBE_DEADLINE,
            poll_timeout: POLL_TIMEOUT,
            json: false,
        }
    }
}
