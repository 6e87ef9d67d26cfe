// File: probe.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::endpoint::Endpoint;
use mio::net::TcpStream;
use mio::Interest;
use rand::Rng;
use std::io;
use std::time::Instant;
use thiserror::Error;

/// Length of the correlation token pushed through the ingress side.
pub const NONCE_LEN: usize = 64;

/// Upper bound for a single banner/token read.
pub const BANNER_READ: usize = 128;

/// Printable ASCII, space through tilde. The token must survive
/// line-oriented reads, so CR and LF are excluded.
const PRINTABLE: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

#[derive(Debug, Error)]
pub enum ProbeError {
    /// Transport disconnect: remote close, reset, or a socket-level error
    /// surfaced by the readiness poll.
    #[error("{0}")]
    Disconnected(String),

    /// Protocol discord: the peer is reachable but does not behave like
    /// the proxy we asked it to be.
    #[error("discord: {0}")]
    Discord(String),
}

impl From<io::Error> for ProbeError {
    fn from(err: io::Error) -> Self {
        ProbeError::Disconnected(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Initiated,
    Established,
    SentConnect,
    RecvCode,
    SameBack,
    DiffBack,
    SentToken,
    RecvToken,
    Discovered,
}

impl ProbeState {
    pub fn code(self) -> u8 {
        match self {
            ProbeState::Initiated => 0,
            ProbeState::Established => 1,
            ProbeState::SentConnect => 2,
            ProbeState::RecvCode => 3,
            ProbeState::SameBack => 4,
            ProbeState::DiffBack => 5,
            ProbeState::SentToken => 6,
            ProbeState::RecvToken => 7,
            ProbeState::Discovered => 8,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            ProbeState::Initiated => "INITIATED",
            ProbeState::Established => "ESTABLISHED",
            ProbeState::SentConnect => "SENT_CONNECT",
            ProbeState::RecvCode => "RECV_CODE",
            ProbeState::SameBack => "SAME_BACK",
            ProbeState::DiffBack => "DIFF_BACK",
            ProbeState::SentToken => "SENT_TOKEN",
            ProbeState::RecvToken => "RECV_TOKEN",
            ProbeState::Discovered => "DISCOVERED",
        }
    }
}

/// One in-flight probe. Outbound probes own the socket dialed at the
/// candidate; inbound probes own a socket accepted by the connect-back
/// listener. The engine is the only mutator.
#[derive(Debug)]
pub struct Probe {
    pub stream: TcpStream,
    pub endpoint: Endpoint,
    pub state: ProbeState,
    pub http_code: u16,
    pub nonce: Option<String>,
    pub last_activity: Instant,
    pub interest: Interest,
    pub outbound: bool,
}

impl Probe {
    pub fn outbound(stream: TcpStream, endpoint: Endpoint) -> Self {
        Self {
            stream,
            endpoint,
            state: ProbeState::Initiated,
            http_code: 0,
            nonce: None,
            last_activity: Instant::now(),
            interest: Interest::READABLE | Interest::WRITABLE,
            outbound: true,
        }
    }

    pub fn inbound(stream: TcpStream, endpoint: Endpoint) -> Self {
        Self {
            stream,
            endpoint,
            state: ProbeState::DiffBack,
            http_code: 0,
            nonce: None,
            last_activity: Instant::now(),
            interest: Interest::READABLE,
            outbound: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Parses the first line of an HTTP CONNECT response. The line must split
/// on single spaces into exactly three fields, the protocol must be
/// literally `HTTP/1.0` or `HTTP/1.1`, and the status must be decimal.
pub fn parse_status_line(line: &str) -> Result<u16, ProbeError> {
    let mut fields = line.splitn(3, ' ');
    let (prot, code, _msg) = match (fields.next(), fields.next(), fields.next()) {
        (Some(p), Some(c), Some(m)) => (p, c, m),
        _ => return Err(ProbeError::Discord(format!("bad header data: {:?}", line))),
    };
    if prot != "HTTP/1.0" && prot != "HTTP/1.1" {
        return Err(ProbeError::Discord(format!("bad protocol: {:?}", line)));
    }
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProbeError::Discord(format!("bad status: {:?}", line)));
    }
    code.parse::<u16>()
        .map_err(|_| ProbeError::Discord(format!("bad status: {:?}", line)))
}

/// Draws a fresh 64-byte token from the printable ASCII set. Collision
/// checking against the nonce index is the caller's job.
pub fn random_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| PRINTABLE[rng.gen_range(0..PRINTABLE.len())] as char)
        .collect()
}
