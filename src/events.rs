// File: events.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::endpoint::Endpoint;
use crate::probe::Probe;
use chrono::Utc;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Phase of a result-stream event. The two-character symbols are stable
/// grep targets for downstream tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Attempt,
    Established,
    Sent,
    Recv,
    SameBack,
    DiffBack,
    TunnelIngress,
    TunnelEgress,
    Failure,
    Harvest,
}

impl Phase {
    pub fn symbol(self) -> &'static str {
        match self {
            Phase::Attempt => "|>",
            Phase::Established => "||",
            Phase::Sent => ">>",
            Phase::Recv => "<<",
            Phase::SameBack => "><",
            Phase::DiffBack => "<|",
            Phase::TunnelIngress => "()",
            Phase::TunnelEgress => ")(",
            Phase::Failure => "--",
            Phase::Harvest => "**",
        }
    }

    fn painted(self) -> ColoredString {
        let sym = self.symbol();
        match self {
            Phase::Attempt => sym.yellow(),
            Phase::Established | Phase::Sent => sym.green(),
            Phase::Recv => sym.green().bold(),
            Phase::SameBack | Phase::DiffBack => sym.cyan(),
            Phase::TunnelIngress | Phase::TunnelEgress => sym.magenta().bold(),
            Phase::Failure => sym.red().bold(),
            Phase::Harvest => sym.white().bold(),
        }
    }
}

/// One structured record emitted by the engine. Probe events carry the
/// handle id, the state code, and the endpoint; engine-level events (the
/// harvest batch line) leave those empty.
#[derive(Debug, Serialize)]
pub struct Event {
    pub phase: Phase,
    pub handle: Option<usize>,
    pub state_code: Option<u8>,
    pub state_key: Option<&'static str>,
    pub endpoint: Option<Endpoint>,
    pub message: String,
}

impl Event {
    pub fn probe(phase: Phase, handle: usize, probe: &Probe, message: impl Into<String>) -> Event {
        Event {
            phase,
            handle: Some(handle),
            state_code: Some(probe.state.code()),
            state_key: Some(probe.state.key()),
            endpoint: Some(probe.endpoint),
            message: message.into(),
        }
    }

    pub fn engine(phase: Phase, message: impl Into<String>) -> Event {
        Event {
            phase,
            handle: None,
            state_code: None,
            state_key: None,
            endpoint: None,
            message: message.into(),
        }
    }
}

/// Renders engine events to stdout and appends them, uncolored, to the
/// log file. `json` switches both streams to NDJSON with an injected
/// timestamp field.
pub struct EventSink {
    json: bool,
    file: Option<Mutex<BufWriter<std::fs::File>>>,
}

impl EventSink {
    pub fn new(json: bool, log_path: Option<&Path>) -> io::Result<EventSink> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };
        Ok(EventSink { json, file })
    }

    pub fn emit(&self, event: &Event) {
        let timestamp = format!("{:.6}", Utc::now().timestamp_micros() as f64 / 1e6);

        if self.json {
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(timestamp),
                );
            }
            let line = serde_json::to_string(&val).unwrap_or_default();
            println!("{}", line);
            self.append(&line);
            return;
        }

        let body = plain_body(event);
        println!("[{}] {} {}", timestamp, event.phase.painted(), body);
        self.append(&format!("[{}] {} {}", timestamp, event.phase.symbol(), body));
    }

    fn append(&self, line: &str) {
        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }
}

fn plain_body(event: &Event) -> String {
    let handle = match event.handle {
        Some(h) => format!("{:>4}", h),
        None => format!("{:>4}", "-"),
    };
    let state = match (event.state_code, event.state_key) {
        (Some(code), Some(key)) => format!("{} {:<12}", code, key),
        _ => format!("- {:<12}", "-"),
    };
    let endpoint = match &event.endpoint {
        Some(ep) => ep.padded(),
        None => format!("{:<21}", "-"),
    };
    format!("{} | {} | {} : {}", handle, state, endpoint, event.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use std::fs;
    use tempfile::TempDir;

    fn sample_event() -> Event {
        Event {
            phase: Phase::SameBack,
            handle: Some(7),
            state_code: Some(4),
            state_key: Some("SAME_BACK"),
            endpoint: Endpoint::parse_line("10.0.0.5:8080"),
            message: "connect-back from source IP".to_string(),
        }
    }

    #[test]
    fn test_symbols_are_stable() {
        assert_eq!(Phase::SameBack.symbol(), "><");
        assert_eq!(Phase::TunnelIngress.symbol(), "()");
        assert_eq!(Phase::TunnelEgress.symbol(), ")(");
        assert_eq!(Phase::Failure.symbol(), "--");
        assert_eq!(Phase::Harvest.symbol(), "**");
    }

    #[test]
    fn test_plain_body_carries_all_fields() {
        let body = plain_body(&sample_event());
        assert!(body.contains("   7"));
        assert!(body.contains("SAME_BACK"));
        assert!(body.contains("10.0.0.5"));
        assert!(body.contains("8080"));
        assert!(body.contains("connect-back from source IP"));
    }

    #[test]
    fn test_engine_event_renders_placeholders() {
        let event = Event::engine(Phase::Harvest, "received 3 new endpoints");
        let body = plain_body(&event);
        assert!(body.contains("received 3 new endpoints"));
        assert!(body.starts_with("   -"));
    }

    #[test]
    fn test_file_sink_appends_symbol_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.log");
        let sink = EventSink::new(false, Some(&path)).unwrap();
        sink.emit(&sample_event());
        sink.emit(&Event::engine(Phase::Harvest, "received 1 new endpoints"));

        let logged = fs::read_to_string(&path).unwrap();
        assert!(logged.contains("><"));
        assert!(logged.contains("**"));
        assert!(logged.contains("10.0.0.5"));
        // uncolored in the file
        assert!(!logged.contains('\x1b'));
    }

    #[test]
    fn test_json_mode_emits_ndjson_with_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.ndjson");
        let sink = EventSink::new(true, Some(&path)).unwrap();
        sink.emit(&sample_event());

        let logged = fs::read_to_string(&path).unwrap();
        let val: serde_json::Value = serde_json::from_str(logged.trim()).unwrap();
        assert_eq!(val["phase"], "same_back");
        assert_eq!(val["handle"], 7);
        assert!(val["timestamp"].is_string());
        assert_eq!(val["endpoint"]["port"], 8080);
    }
}
