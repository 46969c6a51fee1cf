//! Generic table-driven pipeline execution framework: tasks grouped into
//! parallel or sequential stages, run by a single executor that also
//! collects per-task and per-stage timing.

mod metrics;
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
