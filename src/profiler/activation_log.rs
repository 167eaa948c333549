//! Binary activation event log.
//!
//! The profiler worker spools drained activation events to an append-only
//! file, then replays them in lockstep with stack samples. Keeping the spool
//! on disk bounds memory during long sessions and decouples the drain cadence
//! from sample processing.
//!
//! ## File layout
//! ```text
//! Header:  MAGIC (8 bytes) + VERSION (u32 LE) = 12 bytes
//!
//! Wire codes:
//!   0: Activate   -> code(u8) + span(u64+u64) + parent(u64+u64) + timestamp_ns(u64) = 41 bytes
//!   1: Deactivate -> same layout                                                    = 41 bytes
//! ```
//! All integers are little-endian. Timestamps are session nanoseconds.

use crate::profiler::activation::{ActivationEvent, ActivationKind};
use crate::profiler::tracer::SpanContext;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Result, Write};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"ACTEVLOG";
pub const VERSION: u32 = 1;

const WIRE_ACTIVATE: u8 = 0;
const WIRE_DEACTIVATE: u8 = 1;

pub fn write_header(w: &mut impl Write) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())
}

pub fn write_event(w: &mut impl Write, event: &ActivationEvent) -> Result<()> {
    let code = match event.kind {
        ActivationKind::Activate => WIRE_ACTIVATE,
        ActivationKind::Deactivate => WIRE_DEACTIVATE,
    };
    w.write_all(&[code])?;
    w.write_all(&event.span.trace_id.to_le_bytes())?;
    w.write_all(&event.span.span_id.to_le_bytes())?;
    w.write_all(&event.parent.trace_id.to_le_bytes())?;
    w.write_all(&event.parent.span_id.to_le_bytes())?;
    w.write_all(&event.timestamp_nanos.to_le_bytes())
}

pub fn read_header(r: &mut impl Read) -> Result<u32> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "bad activation log magic",
        ));
    }
    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    Ok(u32::from_le_bytes(version))
}

/// Read the next event, or `None` at a clean end of file.
pub fn read_event(r: &mut impl Read) -> Result<Option<ActivationEvent>> {
    let mut code = [0u8; 1];
    match r.read_exact(&mut code) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let kind = match code[0] {
        WIRE_ACTIVATE => ActivationKind::Activate,
        WIRE_DEACTIVATE => ActivationKind::Deactivate,
        other => {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("unknown activation wire code {other}"),
            ))
        }
    };
    let mut buf = [0u8; 40];
    r.read_exact(&mut buf)?;
    let u64_at = |i: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[i..i + 8]);
        u64::from_le_bytes(bytes)
    };
    Ok(Some(ActivationEvent {
        kind,
        span: SpanContext::new(u64_at(0), u64_at(8)),
        parent: SpanContext::new(u64_at(16), u64_at(24)),
        timestamp_nanos: u64_at(32),
    }))
}

/// Appends activation events to the spool file.
pub struct ActivationLogWriter {
    writer: BufWriter<File>,
}

impl ActivationLogWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, event: &ActivationEvent) -> Result<()> {
        write_event(&mut self.writer, event)
    }

    pub fn append_all(&mut self, events: &[ActivationEvent]) -> Result<()> {
        for event in events {
            write_event(&mut self.writer, event)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

/// Replays the spool in timestamp order with a bounded lookahead of one
/// event, so the worker can consume exactly the events at or before each
/// sample timestamp.
pub struct ActivationLogReader {
    reader: BufReader<File>,
    lookahead: Option<ActivationEvent>,
}

impl ActivationLogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let version = read_header(&mut reader)?;
        if version != VERSION {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("unsupported activation log version {version}"),
            ));
        }
        Ok(Self {
            reader,
            lookahead: None,
        })
    }

    /// Next event with `timestamp_nanos <= up_to`, or `None` if the next
    /// event is later (it stays buffered) or the log is exhausted.
    pub fn next_event_up_to(&mut self, up_to: u64) -> Result<Option<ActivationEvent>> {
        if self.lookahead.is_none() {
            self.lookahead = read_event(&mut self.reader)?;
        }
        match self.lookahead {
            Some(event) if event.timestamp_nanos <= up_to => {
                self.lookahead = None;
                Ok(Some(event))
            }
            _ => Ok(None),
        }
    }
}
