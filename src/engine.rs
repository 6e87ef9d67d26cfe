// File: engine.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

//! The readiness core. Everything happens on one thread around one mio
//! `Poll`:
//!  * one registered fd is the harvest FIFO feeding the staging queue,
//!  * one is the bound listener accepting connect-backs from proxies,
//!  * the rest are probe sockets, dialed outbound or accepted inbound.
//!
//! Each iteration reaps expired probes, refills in-flight probes from the
//! queue, waits for readiness with a 1 s ceiling, and dispatches events in
//! the order the poll yields them. Per-probe failures stop at the dispatch
//! boundary; listener and pipe failures terminate the loop.

use crate::config::ScanConfig;
use crate::endpoint::{Endpoint, StagingQueue};
use crate::events::{Event, EventSink, Phase};
use crate::ingest::Fifo;
use crate::probe::{self, Probe, ProbeError, ProbeState, BANNER_READ, NONCE_LEN};
use crate::sockopt;
use crate::stats::SessionStats;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

const LISTENER: Token = Token(0);
const FIFO: Token = Token(1);
const FIRST_PROBE_TOKEN: usize = 2;

/// Readiness flags lifted out of a poll event so dispatch can borrow the
/// engine mutably.
#[derive(Debug, Clone, Copy)]
struct Ready {
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        Ready {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

pub struct Engine {
    config: ScanConfig,
    callback_addr: SocketAddr,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    fifo: Fifo,
    queue: StagingQueue,
    probes: HashMap<Token, Probe>,
    by_ip: HashMap<Ipv4Addr, Token>,
    by_nonce: HashMap<String, Token>,
    next_token: usize,
    sink: EventSink,
    stats: SessionStats,
}

impl Engine {
    pub fn new(config: ScanConfig, sink: EventSink) -> Result<Engine> {
        let poll = Poll::new().context("create readiness poll")?;
        let mut listener = TcpListener::bind(config.listen_addr)
            .with_context(|| format!("bind {}", config.listen_addr))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("register listener")?;
        let callback_addr = match config.callback_addr {
            Some(addr) => addr,
            None => listener.local_addr().context("listener address")?,
        };
        let fifo = Fifo::open(&config.fifo_path)?;
        let fd = fifo.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), FIFO, Interest::READABLE)
            .context("register harvest pipe")?;
        Ok(Engine {
            config,
            callback_addr,
            poll,
            events: Events::with_capacity(256),
            listener,
            fifo,
            queue: StagingQueue::new(),
            probes: HashMap::new(),
            by_ip: HashMap::new(),
            by_nonce: HashMap::new(),
            next_token: FIRST_PROBE_TOKEN,
            sink,
            stats: SessionStats::new(),
        })
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            self.turn()?;
        }
        Ok(())
    }

    /// One pipeline iteration: reap, refill, wait, dispatch.
    pub fn turn(&mut self) -> Result<()> {
        self.reap();
        self.refill();
        if let Err(e) = self.poll.poll(&mut self.events, Some(self.config.poll_timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e).context("readiness wait");
        }
        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), Ready::from(event)))
            .collect();
        for (token, flags) in ready {
            match token {
                LISTENER => self.on_listener(flags)?,
                FIFO => self.on_fifo(flags)?,
                _ => {
                    if let Err(err) = self.on_probe(token, flags) {
                        self.fail_probe(token, &err);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn callback_addr(&self) -> SocketAddr {
        self.callback_addr
    }

    pub fn fifo_path(&self) -> &std::path::Path {
        self.fifo.path()
    }

    /// Number of registered network probes, the quantity the in-flight
    /// cap applies to. The listener and the pipe are not probes.
    pub fn in_flight(&self) -> usize {
        self.probes.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn live_nonces(&self) -> usize {
        self.by_nonce.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Evicts probes past INITIATED whose last activity exceeds the coarse
    /// deadline. INITIATED probes are left to the kernel SYN retry budget.
    fn reap(&mut self) {
        let deadline = self.config.probe_deadline;
        let expired: Vec<Token> = self
            .probes
            .iter()
            .filter(|(_, probe)| {
                probe.state != ProbeState::Initiated && probe.last_activity.elapsed() > deadline
            })
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(probe) = self.probes.get(&token) {
                self.stats.add_timeout();
                self.sink.emit(&Event::probe(
                    Phase::Failure,
                    token.0,
                    probe,
                    format!("no activity for {}s", deadline.as_secs()),
                ));
            }
            self.unregister(token);
        }
    }

    /// The probe factory: drains the queue into fresh probes until the
    /// in-flight cap is reached. Endpoints whose IP already has a probe in
    /// flight are dropped for this cycle.
    fn refill(&mut self) {
        while self.probes.len() < self.config.max_probes {
            let Some(endpoint) = self.queue.pop() else {
                break;
            };
            if self.by_ip.contains_key(&endpoint.ip) {
                debug!(
                    "{} dropped: a probe for {} is already in flight",
                    endpoint, endpoint.ip
                );
                continue;
            }
            if let Err(e) = self.dial(endpoint) {
                warn!("connect to {}: {}", endpoint, e);
            }
        }
    }

    fn dial(&mut self, endpoint: Endpoint) -> io::Result<()> {
        let stream = TcpStream::from_std(sockopt::outbound_socket(endpoint.socket_addr())?);
        let token = self.register_outbound(stream, endpoint)?;
        self.stats.add_attempt();
        if let Some(probe) = self.probes.get(&token) {
            self.sink
                .emit(&Event::probe(Phase::Attempt, token.0, probe, "attempting connect"));
        }
        Ok(())
    }

    fn on_fifo(&mut self, ready: Ready) -> Result<()> {
        if ready.error {
            bail!("harvest pipe error");
        }
        let outcome = self
            .fifo
            .drain(&mut self.queue)
            .context("harvest pipe read")?;
        if outcome.accepted > 0 {
            self.stats.add_harvested(outcome.accepted as u64);
            self.sink.emit(&Event::engine(
                Phase::Harvest,
                format!(
                    "received {} new endpoints (queue: {} probes: {} nonces: {})",
                    outcome.accepted,
                    self.queue.len(),
                    self.probes.len(),
                    self.by_nonce.len()
                ),
            ));
        }
        if outcome.hangup || ready.read_closed {
            self.fifo.reopen().context("harvest pipe reopen")?;
            let fd = self.fifo.as_raw_fd();
            // dup2 swapped the description under the fd; refresh the registration
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), FIFO, Interest::READABLE)
                .context("re-register harvest pipe")?;
        }
        Ok(())
    }

    fn on_listener(&mut self, ready: Ready) -> Result<()> {
        if ready.error || ready.read_closed {
            bail!("listener failure on {}", self.config.listen_addr);
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept_back(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("listener accept"),
            }
        }
        Ok(())
    }

    /// Classifies one accepted connect-back by source IP: a hit in the IP
    /// index confirms a plain open proxy, anything else becomes a
    /// DIFF_BACK probe that has to present a nonce.
    fn accept_back(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = sockopt::apply_accepted(&stream) {
            warn!("socket options on connect-back from {}: {}", peer, e);
        }
        let ip = match peer.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                debug!("dropping IPv6 connect-back from {}", peer);
                return;
            }
        };
        match self.by_ip.get(&ip).copied() {
            Some(ingress) => {
                if let Some(probe) = self.probes.get_mut(&ingress) {
                    probe.touch();
                    probe.state = ProbeState::SameBack;
                    self.sink.emit(&Event::probe(
                        Phase::SameBack,
                        ingress.0,
                        probe,
                        "connected back from source IP",
                    ));
                    let _ = probe.stream.shutdown(Shutdown::Both);
                }
                let _ = stream.shutdown(Shutdown::Both);
                self.stats.add_plain_proxy();
                self.unregister(ingress);
            }
            None => {
                let endpoint = Endpoint::new(ip, peer.port());
                match self.register_inbound(stream, endpoint) {
                    Ok(token) => {
                        if let Some(probe) = self.probes.get(&token) {
                            self.sink.emit(&Event::probe(
                                Phase::DiffBack,
                                token.0,
                                probe,
                                "connection from unknown IP",
                            ));
                        }
                    }
                    Err(e) => warn!("register connect-back from {}: {}", peer, e),
                }
            }
        }
    }

    fn on_probe(&mut self, token: Token, ready: Ready) -> Result<(), ProbeError> {
        match self.probes.get_mut(&token) {
            Some(probe) => probe.touch(),
            // torn down earlier in this wake
            None => return Ok(()),
        }
        if ready.error {
            if let Some(probe) = self.probes.get(&token) {
                return Err(sock_error(&probe.stream));
            }
            return Ok(());
        }
        if ready.readable {
            self.probe_recv(token)?;
        }
        if ready.read_closed || ready.write_closed {
            if self.probes.contains_key(&token) {
                return Err(ProbeError::Disconnected("connection closed".to_string()));
            }
            return Ok(());
        }
        if ready.writable {
            self.probe_writable(token)?;
        }
        Ok(())
    }

    /// INITIATED → ESTABLISHED → SENT_CONNECT: the non-blocking connect
    /// finished, so push the CONNECT request and switch interest to
    /// readable.
    fn probe_writable(&mut self, token: Token) -> Result<(), ProbeError> {
        let callback = self.callback_addr;
        let Some(probe) = self.probes.get_mut(&token) else {
            return Ok(());
        };
        if probe.state != ProbeState::Initiated {
            return Ok(());
        }
        probe.state = ProbeState::Established;
        self.sink.emit(&Event::probe(
            Phase::Established,
            token.0,
            probe,
            "connection established",
        ));
        let request = format!(
            "CONNECT {}:{} HTTP/1.0\r\n\r\n",
            callback.ip(),
            callback.port()
        );
        send_all(&mut probe.stream, request.as_bytes())?;
        probe.state = ProbeState::SentConnect;
        probe.interest = Interest::READABLE;
        self.sink.emit(&Event::probe(
            Phase::Sent,
            token.0,
            probe,
            format!("{:?}", request),
        ));
        self.poll
            .registry()
            .reregister(&mut probe.stream, token, probe.interest)?;
        Ok(())
    }

    fn probe_recv(&mut self, token: Token) -> Result<(), ProbeError> {
        let mut buf = [0u8; BANNER_READ];
        let state;
        let n;
        {
            let Some(probe) = self.probes.get_mut(&token) else {
                return Ok(());
            };
            state = probe.state;
            n = match probe.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(ProbeError::Disconnected("connection closed".to_string()))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(e.into()),
            };
        }
        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
        let line = data.split("\r\n").next().unwrap_or_default().to_string();
        match state {
            ProbeState::SentConnect => self.probe_http(token, &line),
            ProbeState::DiffBack => self.probe_token(token, &line),
            _ => {
                if let Some(probe) = self.probes.get(&token) {
                    self.sink.emit(&Event::probe(
                        Phase::Recv,
                        token.0,
                        probe,
                        format!("unexpected: {:?}", line),
                    ));
                }
                Ok(())
            }
        }
    }

    /// SENT_CONNECT → RECV_CODE → SENT_TOKEN. A 200 means the candidate
    /// opened a connection back through itself, so push the correlation
    /// token down that channel. Interest stays readable: hangup and
    /// errors are delivered regardless, and stray payload gets logged.
    fn probe_http(&mut self, token: Token, line: &str) -> Result<(), ProbeError> {
        let code = probe::parse_status_line(line)?;
        if let Some(probe) = self.probes.get_mut(&token) {
            probe.http_code = code;
            probe.state = ProbeState::RecvCode;
            self.sink.emit(&Event::probe(
                Phase::Recv,
                token.0,
                probe,
                format!("{:?}", line),
            ));
        }
        if code != 200 {
            return Err(ProbeError::Discord(format!("status {} instead of 200", code)));
        }
        let nonce = loop {
            let candidate = probe::random_nonce();
            if !self.by_nonce.contains_key(&candidate) {
                break candidate;
            }
        };
        let Some(probe) = self.probes.get_mut(&token) else {
            return Ok(());
        };
        send_all(&mut probe.stream, nonce.as_bytes())?;
        probe.state = ProbeState::SentToken;
        probe.nonce = Some(nonce.clone());
        self.sink.emit(&Event::probe(
            Phase::Sent,
            token.0,
            probe,
            format!("{:?}", nonce),
        ));
        self.by_nonce.insert(nonce, token);
        Ok(())
    }

    /// DIFF_BACK → RECV_TOKEN → DISCOVERED: the first line must be a live
    /// nonce; the hit joins this egress connection to the ingress probe
    /// that emitted the token, and both sides are torn down.
    fn probe_token(&mut self, token: Token, line: &str) -> Result<(), ProbeError> {
        if line.len() != NONCE_LEN {
            return Err(ProbeError::Discord(format!(
                "token length {} instead of {}",
                line.len(),
                NONCE_LEN
            )));
        }
        let Some(&ingress) = self.by_nonce.get(line) else {
            return Err(ProbeError::Discord(format!("unrecognized token: {:?}", line)));
        };
        let egress_endpoint = match self.probes.get_mut(&token) {
            Some(probe) => {
                probe.state = ProbeState::RecvToken;
                self.sink.emit(&Event::probe(
                    Phase::Recv,
                    token.0,
                    probe,
                    format!("got a token: {:?}", line),
                ));
                probe.endpoint
            }
            None => return Ok(()),
        };
        let ingress_endpoint = match self.probes.get_mut(&ingress) {
            Some(probe) => {
                probe.state = ProbeState::Discovered;
                self.sink.emit(&Event::probe(
                    Phase::TunnelIngress,
                    ingress.0,
                    probe,
                    format!("discovered tunnel to {}", egress_endpoint),
                ));
                let _ = probe.stream.shutdown(Shutdown::Both);
                probe.endpoint
            }
            None => {
                return Err(ProbeError::Discord(
                    "token without live ingress probe".to_string(),
                ))
            }
        };
        if let Some(probe) = self.probes.get_mut(&token) {
            probe.state = ProbeState::Discovered;
            self.sink.emit(&Event::probe(
                Phase::TunnelEgress,
                token.0,
                probe,
                format!("discovered tunnel from {}", ingress_endpoint),
            ));
            let _ = probe.stream.shutdown(Shutdown::Both);
        }
        self.stats.add_tunnel();
        self.unregister(ingress);
        self.unregister(token);
        Ok(())
    }

    fn fail_probe(&mut self, token: Token, err: &ProbeError) {
        if let Some(probe) = self.probes.get(&token) {
            self.stats.add_failure();
            self.sink
                .emit(&Event::probe(Phase::Failure, token.0, probe, err.to_string()));
        }
        self.unregister(token);
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn register_outbound(&mut self, stream: TcpStream, endpoint: Endpoint) -> io::Result<Token> {
        let token = self.alloc_token();
        let mut probe = Probe::outbound(stream, endpoint);
        self.poll
            .registry()
            .register(&mut probe.stream, token, probe.interest)?;
        self.by_ip.insert(endpoint.ip, token);
        self.probes.insert(token, probe);
        Ok(token)
    }

    fn register_inbound(&mut self, stream: TcpStream, endpoint: Endpoint) -> io::Result<Token> {
        let token = self.alloc_token();
        let mut probe = Probe::inbound(stream, endpoint);
        self.poll
            .registry()
            .register(&mut probe.stream, token, probe.interest)?;
        self.probes.insert(token, probe);
        Ok(token)
    }

    /// Removes a probe from the handle table and both indices and closes
    /// its socket. Idempotent: a probe can hit multiple teardown paths in
    /// one wake.
    fn unregister(&mut self, token: Token) {
        let Some(mut probe) = self.probes.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut probe.stream);
        if probe.outbound {
            self.by_ip.remove(&probe.endpoint.ip);
        }
        if let Some(nonce) = probe.nonce.take() {
            self.by_nonce.remove(&nonce);
        }
        // dropping the stream closes it; linger (on, 0) makes that a reset
    }
}

fn send_all(stream: &mut TcpStream, data: &[u8]) -> Result<(), ProbeError> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(ProbeError::Disconnected("write returned zero".to_string())),
            Ok(n) => written += n,
            // payloads are tiny; a full buffer on a fresh connection is a
            // broken peer, not backpressure worth waiting out
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(ProbeError::Disconnected("send buffer full".to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn sock_error(stream: &TcpStream) -> ProbeError {
    match stream.take_error() {
        Ok(Some(err)) => ProbeError::Disconnected(err.to_string()),
        Ok(None) => ProbeError::Disconnected("unknown socket error".to_string()),
        Err(err) => ProbeError::Disconnected(err.to_string()),
    }
}
