pub mod bulk;
pub mod continuous;

pub use bulk::{dispatch_batch, reconcile_batch, BatchReport};
pub use continuous::{run_continuous, LoopStats, Pacing, RefreshPolicy, Step, StepOutcome};
