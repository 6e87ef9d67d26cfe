// File: ingest.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::endpoint::{Endpoint, StagingQueue};
use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Result of draining the pipe: how many new endpoints were queued and
/// whether the writer side hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub accepted: usize,
    pub hangup: bool,
}

/// The harvest pipe. Harvesters write newline-delimited `ip:port` records
/// into a FIFO; the engine keeps the read side open in non-blocking mode
/// and registers its fd with the readiness poll.
pub struct Fifo {
    path: PathBuf,
    file: File,
    pending: String,
}

impl Fifo {
    /// Opens the pipe at `path`, creating the FIFO (and its parent
    /// directory) when missing. Fails if the path exists but is not a
    /// FIFO.
    pub fn open(path: &Path) -> Result<Fifo> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create harvest dir {}", dir.display()))?;
            }
        }
        if !path.exists() {
            mkfifo(path).with_context(|| format!("mkfifo {}", path.display()))?;
        }
        let meta = fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        if !meta.file_type().is_fifo() {
            bail!("{} exists but is not a FIFO", path.display());
        }
        let file = open_nonblocking(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Fifo {
            path: path.to_path_buf(),
            file,
            pending: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Reads everything currently buffered in the pipe and queues every
    /// valid record. Partial trailing lines are kept until the rest
    /// arrives. A read of zero bytes means every writer has closed.
    pub fn drain(&mut self, queue: &mut StagingQueue) -> io::Result<DrainOutcome> {
        let mut buf = [0u8; 4096];
        let mut accepted = 0;
        let mut hangup = false;
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => {
                    hangup = true;
                    break;
                }
                Ok(n) => {
                    self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = self.pending.find('\n') {
                        let line: String = self.pending.drain(..=pos).collect();
                        let line = line.trim_end_matches(['\r', '\n']);
                        if let Some(endpoint) = Endpoint::parse_line(line) {
                            if queue.push(endpoint) {
                                accepted += 1;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(DrainOutcome { accepted, hangup })
    }

    /// Reopens the pipe after writer hangup. `dup2` onto the existing fd
    /// keeps the fd number stable for the readiness registration.
    pub fn reopen(&mut self) -> io::Result<()> {
        let fresh = open_nonblocking(&self.path)?;
        let rc = unsafe { libc::dup2(fresh.as_raw_fd(), self.file.as_raw_fd()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn fifo_pair(dir: &TempDir) -> (Fifo, File) {
        let path = dir.path().join("harvest.fifo");
        let fifo = Fifo::open(&path).unwrap();
        let writer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();
        (fifo, writer)
    }

    #[test]
    fn test_open_creates_fifo_and_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/harvest.fifo");
        let fifo = Fifo::open(&path).unwrap();
        assert!(fifo.as_raw_fd() >= 0);
        assert!(path.exists());
    }

    #[test]
    fn test_open_rejects_non_fifo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"x").unwrap();
        assert!(Fifo::open(&path).is_err());
    }

    #[test]
    fn test_drain_parses_and_dedups() {
        let dir = TempDir::new().unwrap();
        let (mut fifo, mut writer) = fifo_pair(&dir);
        let mut queue = StagingQueue::new();

        writer
            .write_all(b"10.0.0.5:8080\n10.0.0.5:8080\ngarbage\n4.3.2.1:3128\n")
            .unwrap();
        let outcome = fifo.drain(&mut queue).unwrap();
        assert_eq!(outcome.accepted, 2);
        assert!(!outcome.hangup);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().to_string(), "10.0.0.5:8080");
        assert_eq!(queue.pop().unwrap().to_string(), "4.3.2.1:3128");
    }

    #[test]
    fn test_drain_buffers_partial_lines() {
        let dir = TempDir::new().unwrap();
        let (mut fifo, mut writer) = fifo_pair(&dir);
        let mut queue = StagingQueue::new();

        writer.write_all(b"1.2.3.4:80").unwrap();
        let outcome = fifo.drain(&mut queue).unwrap();
        assert_eq!(outcome.accepted, 0);
        assert!(queue.is_empty());

        writer.write_all(b"80\n").unwrap();
        let outcome = fifo.drain(&mut queue).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(queue.pop().unwrap().to_string(), "1.2.3.4:8080");
    }

    #[test]
    fn test_drain_reports_hangup_and_reopen_keeps_fd() {
        let dir = TempDir::new().unwrap();
        let (mut fifo, writer) = fifo_pair(&dir);
        let mut queue = StagingQueue::new();
        let fd_before = fifo.as_raw_fd();

        drop(writer);
        let outcome = fifo.drain(&mut queue).unwrap();
        assert!(outcome.hangup);

        fifo.reopen().unwrap();
        assert_eq!(fifo.as_raw_fd(), fd_before);

        let mut writer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo.path())
            .unwrap();
        writer.write_all(b"10.0.0.9:1080\n").unwrap();
        let outcome = fifo.drain(&mut queue).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(queue.pop().unwrap().to_string(), "10.0.0.9:1080");
    }

    #[test]
    fn test_drain_ignores_blank_and_crlf_lines() {
        let dir = TempDir::new().unwrap();
        let (mut fifo, mut writer) = fifo_pair(&dir);
        let mut queue = StagingQueue::new();

        writer.write_all(b"\n\n10.1.1.1:81\r\n\n").unwrap();
        let outcome = fifo.drain(&mut queue).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(queue.pop().unwrap().to_string(), "10.1.1.1:81");
    }
}
