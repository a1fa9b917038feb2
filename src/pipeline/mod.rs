pub mod context;
pub mod orchestrator;
pub mod phase_trait;
pub mod phases;

pub use context::{PipelineContext, RequestContext};
pub use orchestrator::{PipelineOrchestrator, COMPLETED_REASON};
pub use phase_trait::WorkflowPhase;
