//! Decoder collaborator and a TOML signal database implementing it.
//!
//! File layout:
//!
//! ```toml
//! [[message]]
//! id = 0x100
//! name = "EngineData"
//! length = 8
//!
//! [[message.signal]]
//! name = "Rpm"
//! start = 0
//! length = 16
//! byte_order = "little_endian"   # or "big_endian" (start = MSB, sawtooth numbering)
//! factor = 0.25
//!
//! [[message.signal]]
//! name = "Gear"
//! start = 16
//! length = 4
//! values = { "0" = "Park", "1" = "Reverse" }
//! ```

use anyhow::{Context, Result, bail, ensure};
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::types::{DecodedMessage, MAX_PAYLOAD_LEN, SignalValue};

/// Turns an identifier + payload into a named message. `None` is a valid outcome (unknown id,
/// conflicting length) and never an error.
pub trait Decoder: Send + Sync {
    fn decode(&self, id: u32, payload: &[u8]) -> Option<DecodedMessage>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

#[derive(Debug, Deserialize)]
struct DatabaseFile {
    #[serde(default)]
    message: Vec<MessageEntry>,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    id: u32,
    name: String,
    length: usize,
    #[serde(default)]
    signal: Vec<SignalEntry>,
}

#[derive(Debug, Deserialize)]
struct SignalEntry {
    name: String,
    start: u16,
    length: u16,
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default)]
    signed: bool,
    #[serde(default = "default_factor")]
    factor: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

fn default_factor() -> f64 {
    1.0
}

/// One signal, with its bit positions resolved MSB first at load time.
#[derive(Clone, Debug)]
pub struct SignalDef {
    pub name: String,
    bits: Vec<u16>,
    signed: bool,
    factor: f64,
    offset: f64,
    values: HashMap<i64, String>,
}

impl SignalDef {
    fn raw(&self, payload: &[u8]) -> i64 {
        let raw = self.bits.iter().fold(0_u64, |acc, &pos| {
            let bit = (payload[usize::from(pos / 8)] >> (pos % 8)) & 1;
            (acc << 1) | u64::from(bit)
        });
        let len = self.bits.len();
        if self.signed && len < 64 && (raw >> (len - 1)) & 1 == 1 {
            (raw as i64) - (1_i64 << len)
        } else {
            raw as i64
        }
    }

    fn value(&self, payload: &[u8]) -> SignalValue {
        let raw = self.raw(payload);
        match self.values.get(&raw) {
            Some(label) => SignalValue::Enum(label.clone()),
            None => SignalValue::Number(raw as f64 * self.factor + self.offset),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageDef {
    pub name: String,
    pub length: usize,
    pub signals: Vec<SignalDef>,
}

/// Bit positions (byte * 8 + bit, bit 0 = LSB) of a signal, most significant first.
fn signal_bits(start: u16, length: u16, order: ByteOrder, payload_bits: u16) -> Result<Vec<u16>> {
    ensure!((1..=64).contains(&length), "signal length {length} not in 1..=64");
    let bits = match order {
        ByteOrder::LittleEndian => {
            let end = start
                .checked_add(length)
                .context("signal extends past the payload")?;
            ensure!(end <= payload_bits, "signal extends past the payload");
            (start..end).rev().collect()
        }
        ByteOrder::BigEndian => {
            let mut out = Vec::with_capacity(usize::from(length));
            let mut pos = start;
            for i in 0..length {
                ensure!(pos < payload_bits, "signal extends past the payload");
                out.push(pos);
                if i + 1 < length {
                    pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
                }
            }
            out
        }
    };
    Ok(bits)
}

/// Signal database keyed by identifier.
#[derive(Clone, Debug, Default)]
pub struct SignalDatabase {
    messages: HashMap<u32, MessageDef>,
}

impl SignalDatabase {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read signal database {}", path.display()))?;
        let db = Self::from_toml_str(&text)
            .with_context(|| format!("parse signal database {}", path.display()))?;
        debug!("Loaded {} message definitions from {}", db.len(), path.display());
        Ok(db)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: DatabaseFile = toml::from_str(text)?;
        let mut messages = HashMap::with_capacity(file.message.len());
        for m in file.message {
            ensure!(
                m.length <= MAX_PAYLOAD_LEN,
                "message {} declares {} bytes",
                m.name,
                m.length
            );
            let payload_bits = (m.length * 8) as u16;
            let mut signals = Vec::with_capacity(m.signal.len());
            for s in m.signal {
                let bits = signal_bits(s.start, s.length, s.byte_order, payload_bits)
                    .with_context(|| format!("{}.{}", m.name, s.name))?;
                let mut values = HashMap::with_capacity(s.values.len());
                for (k, v) in s.values {
                    let raw: i64 = k
                        .trim()
                        .parse()
                        .with_context(|| format!("{}.{}: bad value key {k}", m.name, s.name))?;
                    values.insert(raw, v);
                }
                signals.push(SignalDef {
                    name: s.name,
                    bits,
                    signed: s.signed,
                    factor: s.factor,
                    offset: s.offset,
                    values,
                });
            }
            if messages
                .insert(
                    m.id,
                    MessageDef {
                        name: m.name.clone(),
                        length: m.length,
                        signals,
                    },
                )
                .is_some()
            {
                bail!("duplicate message id {:#X} ({})", m.id, m.name);
            }
        }
        Ok(Self { messages })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message(&self, id: u32) -> Option<&MessageDef> {
        self.messages.get(&id)
    }
}

impl Decoder for SignalDatabase {
    fn decode(&self, id: u32, payload: &[u8]) -> Option<DecodedMessage> {
        let def = self.messages.get(&id)?;
        if payload.len() != def.length {
            return None;
        }
        let signals = def
            .signals
            .iter()
            .map(|s| (s.name.clone(), s.value(payload)))
            .collect();
        Some(DecodedMessage {
            name: def.name.clone(),
            signals,
        })
    }
}
