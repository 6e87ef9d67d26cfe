// File: endpoint.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

static ENDPOINT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{1,3}(\.[0-9]{1,3}){3}:[0-9]{1,5}$").unwrap());

/// A candidate proxy endpoint: IPv4 address plus TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parses one harvested record. Returns `None` for anything that does
    /// not match the `a.b.c.d:port` wire format; invalid records are
    /// dropped silently by the caller.
    pub fn parse_line(line: &str) -> Option<Endpoint> {
        if !ENDPOINT_LINE.is_match(line) {
            return None;
        }
        let (ip, port) = line.split_once(':')?;
        let ip: Ipv4Addr = ip.parse().ok()?;
        let port: u16 = port.parse().ok()?;
        if port == 0 {
            return None;
        }
        Some(Endpoint::new(ip, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Fixed-width rendering for aligned log lines.
    pub fn padded(&self) -> String {
        format!("{:<15} {:<5}", self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Staging area between the ingest pipe and the probe factory: an
/// insertion-ordered set. Pushing an endpoint that is already queued is a
/// no-op, so duplicate records arriving on the pipe collapse here.
#[derive(Debug, Default)]
pub struct StagingQueue {
    order: VecDeque<Endpoint>,
    members: HashSet<Endpoint>,
}

impl StagingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the endpoint was newly queued.
    pub fn push(&mut self, endpoint: Endpoint) -> bool {
        if !self.members.insert(endpoint) {
            return false;
        }
        self.order.push_back(endpoint);
        true
    }

    pub fn pop(&mut self) -> Option<Endpoint> {
        let endpoint = self.order.pop_front()?;
        self.members.remove(&endpoint);
        Some(endpoint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
