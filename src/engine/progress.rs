//! Live counter of processed frames, driven by the status reporter.

use kdam::{Animation, Bar, BarExt};
use std::sync::{Arc, Mutex};

use crate::pipeline::context::StatusCallback;
use crate::pipeline::health::HealthSnapshot;

// Progress bar type alias
pub type ProgressBar = Arc<Mutex<Bar>>;

/// Create a counter for an open-ended stream (shows count and rate, no percentage).
pub fn create_counter(desc: &'static str) -> ProgressBar {
    Arc::new(Mutex::new(kdam::tqdm!(
        total = 0,
        desc = desc,
        animation = Animation::Classic,
        position = 0,
        unit = " frames"
    )))
}

/// Force a refresh of the bar (e.g. so the counter shows "0 frames" immediately).
pub fn refresh_bar(pb: &ProgressBar) {
    if let Ok(mut bar) = pb.try_lock() {
        let _ = bar.refresh();
    }
}

/// Move the counter to `n`. Uses try_lock so the reporter never blocks on the terminal.
pub fn set_progress(pb: &ProgressBar, n: usize) {
    if let Ok(mut bar) = pb.try_lock() {
        let _ = bar.update_to(n);
    }
}

/// Status observer that keeps `pb` at the processed-frame count of each snapshot.
pub fn status_counter(pb: &ProgressBar) -> StatusCallback {
    let bar = Arc::clone(pb);
    Box::new(move |snap: &HealthSnapshot| {
        set_progress(&bar, snap.counters.processed as usize);
    })
}
