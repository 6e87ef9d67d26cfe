// File: sockopt.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// SYN retry budget requested for outbound probes. INITIATED probes are
/// not reaped by the coarse deadline; this is their only timeout.
pub const SYN_RETRIES: u8 = 7;

const IPTOS_LOWDELAY: u32 = 0x10;

/// Creates a probe socket and starts a non-blocking connect. Linger is
/// (on, 0s) so close sends an immediate reset instead of parking the
/// connection in TIME_WAIT.
pub fn outbound_socket(addr: SocketAddr) -> io::Result<std::net::TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_keepalive(false)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    socket.set_tos(IPTOS_LOWDELAY)?;
    set_syn_retries(socket.as_raw_fd(), SYN_RETRIES)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        // a synchronous refusal still yields a registered probe; the
        // readiness poll reports the dead socket on the next wake
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Applies the probe socket hygiene to a connection accepted by the
/// connect-back listener.
pub fn apply_accepted(stream: &mio::net::TcpStream) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_keepalive(false)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    socket.set_tos(IPTOS_LOWDELAY)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_syn_retries(fd: RawFd, count: u8) -> io::Result<()> {
    let value = count as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_SYNCNT,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_syn_retries(_fd: RawFd, _count: u8) -> io::Result<()> {
    // no per-socket SYN budget here; the kernel default applies
    Ok(())
}
