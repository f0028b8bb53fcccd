//! Pipeline components: rate gate, channels, breakers, health, the two workers, batch logging,
//! and the controller that owns them.

pub mod batch;
pub mod breaker;
pub mod capture;
pub mod channel;
pub mod context;
pub mod controller;
pub mod error_handler;
pub mod health;
pub mod processing;
pub mod rate;

pub use batch::BatchLogger;
pub use breaker::{BreakerState, CircuitBreaker};
pub use capture::{Backoff, CaptureLoop, CaptureParts, TxRequest};
pub use channel::{BoundedChannel, ChannelRx, ChannelTx, PopError, PushError};
pub use context::{
    BreakerSettings, Collaborators, ErrorCallback, LoopState, LoopStatus, PipelineTuning,
    StatusCallback,
};
pub use controller::PipelineController;
pub use error_handler::{LogSampler, report_shutdown};
pub use health::{
    ActivityLevel, CounterSnapshot, Counters, HealthAccounting, HealthSnapshot, MemoryLevel,
    RollingWindow, Stage,
};
pub use processing::{FrameFilter, IdFilter, ProcessingLoop, ProcessingParts, validate_frame};
pub use rate::RateLimiter;
