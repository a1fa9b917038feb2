use super::context::{PipelineContext, RequestContext};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait WorkflowPhase: Send + Sync {
    fn name(&self) -> &'static str;

    /// State reason recorded before the phase runs, if it has one
    fn reason(&self) -> Option<&'static str> {
        None
    }

    async fn execute(&self, pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()>;
}
