//! Hardware collaborator: the poll/send/close contract plus two sources (simulated bus, candump replay).
//!
//! Detection/enumeration of real adapters is outside the pipeline; anything that can implement
//! [`Hardware`] can feed it.

use anyhow::{Context, Result, bail, ensure};
use log::{debug, warn};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::types::{Direction, MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, MAX_STANDARD_ID, RawFrame};

/// Bus handle owned exclusively by the capture worker.
pub trait Hardware: Send {
    /// Wait at most `timeout` for the next frame. `Ok(None)` on timeout; `Err` for transient faults.
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>>;

    /// Put a frame on the bus.
    fn send(&mut self, id: u32, payload: &[u8]) -> Result<()>;

    /// Release the handle. Called exactly once, on capture exit.
    fn close(&mut self) -> Result<()>;

    /// Connection liveness.
    fn is_connected(&self) -> bool;

    /// True when a finite source (e.g. a replay file) has nothing more to give.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Short human description for logs.
    fn describe(&self) -> String {
        "hardware".to_string()
    }
}

// ---- Simulated bus ----

/// Emits one periodic frame and echoes transmitted frames back (receive-own-messages).
pub struct SimulatedBus {
    id: u32,
    payload: Vec<u8>,
    period: Duration,
    channel: u16,
    next_due: Instant,
    echo: VecDeque<RawFrame>,
    connected: bool,
}

impl SimulatedBus {
    /// Reference traffic: id 0x100, payload 01..08.
    pub const DEFAULT_ID: u32 = 0x100;
    pub const DEFAULT_PAYLOAD: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    /// `period` between generated frames (zero disables generation; only echoes are produced).
    pub fn new(period: Duration) -> Self {
        Self {
            id: Self::DEFAULT_ID,
            payload: Self::DEFAULT_PAYLOAD.to_vec(),
            period,
            channel: 0,
            next_due: Instant::now(),
            echo: VecDeque::new(),
            connected: true,
        }
    }

    /// Frames per second convenience.
    pub fn with_rate(per_sec: u32) -> Self {
        if per_sec == 0 {
            Self::new(Duration::ZERO)
        } else {
            Self::new(Duration::from_secs_f64(1.0 / per_sec as f64))
        }
    }

    pub fn with_frame(mut self, id: u32, payload: &[u8]) -> Self {
        self.id = id;
        self.payload = payload.to_vec();
        self
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }
}

impl Hardware for SimulatedBus {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        ensure!(self.connected, "simulated bus is closed");
        if let Some(frame) = self.echo.pop_front() {
            return Ok(Some(frame));
        }
        if self.period.is_zero() {
            thread::sleep(timeout);
            return Ok(None);
        }
        let now = Instant::now();
        if now < self.next_due {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        // Schedule from the previous due time; skip ahead if we fell far behind.
        self.next_due += self.period;
        let now = Instant::now();
        if self.next_due + self.period < now {
            self.next_due = now + self.period;
        }
        Ok(Some(
            RawFrame::new(self.id, &self.payload, Direction::Received).with_channel(self.channel),
        ))
    }

    fn send(&mut self, id: u32, payload: &[u8]) -> Result<()> {
        ensure!(self.connected, "simulated bus is closed");
        ensure!(id <= MAX_EXTENDED_ID, "id {id:#X} exceeds 29 bits");
        ensure!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        );
        self.echo
            .push_back(RawFrame::new(id, payload, Direction::Transmitted).with_channel(self.channel));
        debug!("simulated send: id={id:#X} data={payload:02X?}");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.echo.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        format!("simulated bus (id {:#X}, period {:?})", self.id, self.period)
    }
}

// ---- candump replay ----

/// One line of a candump log, before pacing.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedFrame {
    /// Seconds since the epoch as written in the log.
    pub time_s: f64,
    pub interface: String,
    pub id: u32,
    pub extended: bool,
    pub payload: Vec<u8>,
}

/// Parse `(1436509052.249713) can0 0F0#0102` (also `1F334455#` extended, `123#R` remote → empty payload).
pub fn parse_candump_line(line: &str) -> Result<LoggedFrame> {
    let mut parts = line.split_whitespace();
    let ts = parts.next().context("missing timestamp")?;
    let iface = parts.next().context("missing interface")?;
    let body = parts.next().context("missing frame")?;

    let ts = ts
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .context("timestamp must be parenthesised")?;
    let time_s: f64 = ts.parse().with_context(|| format!("bad timestamp {ts}"))?;

    let (id_str, data_str) = body.split_once('#').context("frame must contain '#'")?;
    if data_str.starts_with('#') {
        bail!("CAN FD frames are not supported");
    }
    ensure!(!id_str.is_empty() && id_str.len() <= 8, "bad id {id_str}");
    let id = u32::from_str_radix(id_str, 16).with_context(|| format!("bad id {id_str}"))?;
    let extended = id_str.len() > 3;
    ensure!(
        id <= if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID },
        "id {id_str} out of range"
    );

    let payload = if data_str.starts_with('R') {
        Vec::new()
    } else {
        let hex: String = data_str.chars().filter(|c| *c != '.').collect();
        ensure!(
            hex.is_ascii() && hex.len() % 2 == 0,
            "bad payload length in {data_str}"
        );
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .with_context(|| format!("bad payload {data_str}"))?;
        ensure!(bytes.len() <= MAX_PAYLOAD_LEN, "payload longer than 8 bytes");
        bytes
    };

    Ok(LoggedFrame {
        time_s,
        interface: iface.to_string(),
        id,
        extended,
        payload,
    })
}

/// Channel number from an interface name suffix (`can1` → 1, `vcan0` → 0, `any` → 0).
fn channel_of(interface: &str) -> u16 {
    let digits = interface
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    let start = interface.len() - digits;
    interface[start..].parse().unwrap_or(0)
}

/// Replays a candump log, optionally preserving the recorded inter-frame timing.
pub struct ReplayBus {
    frames: VecDeque<LoggedFrame>,
    total: usize,
    realtime: bool,
    /// (log time of first frame, wall instant it was replayed)
    origin: Option<(f64, Instant)>,
    connected: bool,
    label: String,
}

impl ReplayBus {
    /// Load every parseable line of `path`. Malformed lines are skipped with a warning.
    pub fn open(path: &Path, realtime: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open replay log {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut frames = Vec::new();
        let mut skipped = 0_usize;
        for (n, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("read replay log {}", path.display()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_candump_line(trimmed) {
                Ok(f) => frames.push(f),
                Err(e) => {
                    skipped += 1;
                    warn!("{}:{}: skipping line: {e}", path.display(), n + 1);
                }
            }
        }
        if skipped > 0 {
            warn!("Skipped {skipped} malformed lines in {}", path.display());
        }
        Ok(Self::from_frames(frames, realtime, path.display().to_string()))
    }

    pub fn from_frames(frames: Vec<LoggedFrame>, realtime: bool, label: String) -> Self {
        let total = frames.len();
        Self {
            frames: frames.into(),
            total,
            realtime,
            origin: None,
            connected: true,
            label,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl Hardware for ReplayBus {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        ensure!(self.connected, "replay source is closed");
        let Some(next) = self.frames.front() else {
            thread::sleep(timeout);
            return Ok(None);
        };
        if self.realtime {
            let (t0, start) = *self.origin.get_or_insert((next.time_s, Instant::now()));
            let offset = Duration::from_secs_f64((next.time_s - t0).max(0.0));
            let due = start + offset;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(None);
                }
                thread::sleep(wait);
            }
        }
        let Some(f) = self.frames.pop_front() else {
            return Ok(None);
        };
        let mut frame =
            RawFrame::new(f.id, &f.payload, Direction::Received).with_channel(channel_of(&f.interface));
        frame.extended = f.extended;
        Ok(Some(frame))
    }

    fn send(&mut self, id: u32, _payload: &[u8]) -> Result<()> {
        bail!("replay source is read-only (dropped transmit of {id:#X})")
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        debug!(
            "replay closed: {} of {} frames delivered",
            self.total - self.frames.len(),
            self.total
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }

    fn describe(&self) -> String {
        format!("replay of {} ({} frames)", self.label, self.total)
    }
}
