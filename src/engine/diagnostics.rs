//! Diagnostic trouble codes: the lookup collaborator, a file-backed table, and the scanner that
//! finds candidate codes in a decoded message or its raw payload.

use anyhow::{Context, Result};
use log::debug;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use crate::types::{DecodedMessage, DiagnosticHit, DtcInfo};

/// Resolves a code such as `P0301` to its table entry.
pub trait DiagnosticMatcher: Send + Sync {
    fn lookup(&self, code: &str) -> Option<DtcInfo>;
}

/// `code → info` table loaded from TOML (`[P0301] name = ...`) or JSON (`{"P0301": {...}}`).
#[derive(Clone, Debug, Default)]
pub struct DtcTable {
    entries: HashMap<String, DtcInfo>,
}

impl DtcTable {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read DTC table {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let entries: HashMap<String, DtcInfo> = if is_json {
            serde_json::from_str(&text)
                .with_context(|| format!("parse DTC table {}", path.display()))?
        } else {
            toml::from_str(&text).with_context(|| format!("parse DTC table {}", path.display()))?
        };
        debug!("Loaded {} DTC definitions from {}", entries.len(), path.display());
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, DtcInfo)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(code, info)| (code.to_ascii_uppercase(), info))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DiagnosticMatcher for DtcTable {
    fn lookup(&self, code: &str) -> Option<DtcInfo> {
        self.entries.get(code).cloned()
    }
}

/// Category letter (powertrain, chassis, body, network), a digit 0-3, three hex digits.
fn dtc_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[PCBU][0-3][0-9A-F]{3}").expect("DTC pattern compiles"))
}

/// Every distinct code-shaped substring of `text` (upper-cased first), in order of appearance.
pub fn candidate_codes(text: &str) -> Vec<String> {
    let upper = text.to_ascii_uppercase();
    let mut seen = BTreeSet::new();
    dtc_pattern()
        .find_iter(&upper)
        .map(|m| m.as_str().to_string())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Scan decoded signal values, or the payload hex when the frame is undecoded, and resolve each
/// candidate against `matcher`. Codes missing from the table are not reported.
pub fn find_diagnostics(
    matcher: &dyn DiagnosticMatcher,
    decoded: Option<&DecodedMessage>,
    payload_hex: &str,
) -> Vec<DiagnosticHit> {
    let mut hits = Vec::new();
    match decoded {
        Some(msg) => {
            for (signal, value) in &msg.signals {
                for code in candidate_codes(&value.to_string()) {
                    if let Some(info) = matcher.lookup(&code) {
                        hits.push(DiagnosticHit {
                            code,
                            info,
                            source_signal: Some(signal.clone()),
                        });
                    }
                }
            }
        }
        None => {
            for code in candidate_codes(payload_hex) {
                if let Some(info) = matcher.lookup(&code) {
                    hits.push(DiagnosticHit {
                        code,
                        info,
                        source_signal: None,
                    });
                }
            }
        }
    }
    hits
}
