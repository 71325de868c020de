//! Application services orchestrating pipeline execution.

mod coordinator;
mod dispatch;
mod engine;
mod feedback;
mod logs;
mod worker;

pub use coordinator::{ExecutionCoordinator, ExecutionError, ExecutionResult};
pub use dispatch::{
    CancelOutcome, ClaimedTask, DispatchError, DispatchResult, DispatchService, DispatchSettings,
};
pub use engine::{Engine, EngineHandle, EngineParts};
pub use feedback::{
    FeedbackOutcome, ReviewFeedbackError, ReviewFeedbackResult, ScmFeedbackService,
};
pub use logs::{LogLineStream, LogStreamError, LogStreamRequest, LogStreamService};
pub use worker::{LeaseReaper, ProcessOutcome, Worker};
