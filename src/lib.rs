//! canflow: bounded, rate-limited CAN capture pipeline with breaker-guarded SQLite logging

pub mod engine;
pub mod pipeline;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use engine::{Decoder, DiagnosticMatcher, Hardware, Sink, Storage};
pub use pipeline::{Collaborators, HealthSnapshot, PipelineController, PipelineTuning};

use log::debug;

/// Result alias used by public canflow API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Start a pipeline over `hardware` with tuning derived from `opts`.
///
/// Storage, decoder, matcher, sinks and filters come from `collaborators`; use
/// [`engine::build_collaborators`] to get the ones `opts` describes (SQLite log at `opts.db_path`,
/// signal database, DTC table, console / JSON-lines sinks, id filter).
///
/// The returned controller is running; call [`PipelineController::stop`] (or drop it) to shut
/// down in order.
///
/// ```ignore
/// let opts = canflow::Opts { dry_run: true, ..Default::default() };
/// let collab = canflow::engine::build_collaborators(&opts)?;
/// let mut pipeline = canflow::start_pipeline(Box::new(canflow::engine::SimulatedBus::with_rate(100)), &opts, collab)?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// println!("{:?}", pipeline.status());
/// pipeline.stop();
/// ```
pub fn start_pipeline(
    hardware: Box<dyn Hardware>,
    opts: &Opts,
    collaborators: Collaborators,
) -> Result<PipelineController> {
    let config_str = format!(
        "{} CONFIG:{:#?}",
        env!("CARGO_PKG_NAME").to_string().to_uppercase(),
        opts
    );
    debug!("{}", config_str);

    let mut controller = PipelineController::new(PipelineTuning::from(opts));
    controller.start(hardware, collaborators)?;
    Ok(controller)
}
