//! Load `.canflow.toml` (CLI only). Lib callers build [`Opts`] themselves.
//!
//! ```toml
//! [capture]
//! max_rate = 500
//! channel_capacity = 20000
//! id_filter = ["100", "0x7DF"]
//!
//! [storage]
//! db_path = "bus.db"
//! batch_size = 200
//! failure_threshold = 5
//! cooldown_secs = 30
//!
//! [health]
//! rate_window_secs = 5
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Opts;
use crate::engine::arg_parser::parse_can_id;
use crate::utils::config::PackagePaths;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanflowToml {
    #[serde(default)]
    capture: CaptureSection,
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    health: HealthSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureSection {
    max_rate: Option<u32>,
    channel_capacity: Option<usize>,
    poll_timeout_ms: Option<u64>,
    push_timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    cooldown_secs: Option<f64>,
    id_filter: Option<Vec<String>>,
    signals: Option<String>,
    dtc: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageSection {
    db_path: Option<String>,
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_pending: Option<usize>,
    max_inflight_flushes: Option<usize>,
    failure_threshold: Option<u32>,
    cooldown_secs: Option<f64>,
    jsonl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthSection {
    rate_window_secs: Option<f64>,
    error_window_secs: Option<f64>,
    status_interval_ms: Option<u64>,
    processing_failure_threshold: Option<u32>,
    processing_cooldown_secs: Option<f64>,
    verbose: Option<bool>,
    print_every: Option<usize>,
}

pub fn parse_canflow_toml(text: &str) -> Result<CanflowToml> {
    Ok(toml::from_str(text)?)
}

/// Load an explicitly requested config file. Any read or parse problem is an error.
pub fn load_canflow_toml(path: &Path) -> Result<CanflowToml> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_canflow_toml(&s).with_context(|| format!("parse config {}", path.display()))
}

/// Load `.canflow.toml` from `dir` if present. `Ok(None)` if missing; the caller decides whether
/// an unreadable or invalid file is fatal.
pub fn load_default_canflow_toml(dir: &Path) -> Result<Option<CanflowToml>> {
    let path = dir.join(PackagePaths::get().config_filename());
    if !path.is_file() {
        return Ok(None);
    }
    load_canflow_toml(&path).map(Some)
}

/// Overwrite opts field from file when present.
macro_rules! apply_file_opt {
    ($sec:expr, $opts:expr, $sec_field:ident => $opts_field:ident) => {
        if let Some(v) = $sec.$sec_field {
            $opts.$opts_field = v;
        }
    };
    ($sec:expr, $opts:expr, $sec_field:ident => $opts_field:ident, try $conv:expr) => {
        if let Some(v) = $sec.$sec_field {
            $opts.$opts_field = $conv(v).with_context(|| format!("{} = {v}", stringify!($sec_field)))?;
        }
    };
    ($sec:expr, $opts:expr, $sec_field:ident => $opts_field:ident, $conv:expr) => {
        if let Some(v) = $sec.$sec_field {
            $opts.$opts_field = $conv(v);
        }
    };
}

/// Seconds as a duration. Negative values clamp to zero; infinite or overflowing ones are errors.
pub fn secs_to_duration(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0)).map_err(anyhow::Error::from)
}

/// Apply file config to opts (only fields present in the file). Call before applying CLI.
pub fn apply_file_to_opts(file: &CanflowToml, opts: &mut Opts) -> Result<()> {
    let millis = Duration::from_millis;

    let cap = &file.capture;
    apply_file_opt!(cap, opts, max_rate => max_rate);
    apply_file_opt!(cap, opts, channel_capacity => channel_capacity);
    apply_file_opt!(cap, opts, poll_timeout_ms => poll_timeout, millis);
    apply_file_opt!(cap, opts, push_timeout_ms => push_timeout, millis);
    apply_file_opt!(cap, opts, failure_threshold => capture_failure_threshold);
    apply_file_opt!(cap, opts, cooldown_secs => capture_cooldown, try secs_to_duration);
    if let Some(ref p) = cap.signals {
        opts.signals_path = Some(PathBuf::from(p));
    }
    if let Some(ref p) = cap.dtc {
        opts.dtc_path = Some(PathBuf::from(p));
    }
    if let Some(ref ids) = cap.id_filter {
        opts.id_filter = ids
            .iter()
            .map(|s| parse_can_id(s).map_err(anyhow::Error::msg))
            .collect::<Result<Vec<u32>>>()
            .context("[capture] id_filter")?;
    }

    let st = &file.storage;
    if let Some(ref p) = st.db_path {
        opts.db_path = Some(PathBuf::from(p));
    }
    apply_file_opt!(st, opts, batch_size => batch_size);
    apply_file_opt!(st, opts, flush_interval_ms => flush_interval, millis);
    apply_file_opt!(st, opts, max_pending => max_pending);
    apply_file_opt!(st, opts, max_inflight_flushes => max_inflight_flushes);
    apply_file_opt!(st, opts, failure_threshold => storage_failure_threshold);
    apply_file_opt!(st, opts, cooldown_secs => storage_cooldown, try secs_to_duration);
    if let Some(ref p) = st.jsonl {
        opts.jsonl_path = Some(PathBuf::from(p));
    }

    let h = &file.health;
    apply_file_opt!(h, opts, rate_window_secs => rate_window, try secs_to_duration);
    apply_file_opt!(h, opts, error_window_secs => error_window, try secs_to_duration);
    apply_file_opt!(h, opts, status_interval_ms => status_interval, millis);
    apply_file_opt!(h, opts, processing_failure_threshold => processing_failure_threshold);
    apply_file_opt!(h, opts, processing_cooldown_secs => processing_cooldown, try secs_to_duration);
    apply_file_opt!(h, opts, verbose => verbose);
    apply_file_opt!(h, opts, print_every => print_every);
    Ok(())
}
