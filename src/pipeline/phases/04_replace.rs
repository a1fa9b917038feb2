use crate::error::Result;
use crate::pipeline::context::{PipelineContext, RequestContext};
use crate::pipeline::phase_trait::WorkflowPhase;
use crate::replacements;
use async_trait::async_trait;

pub struct ReplacePhase;

#[async_trait]
impl WorkflowPhase for ReplacePhase {
    fn name(&self) -> &'static str {
        "replace"
    }

    async fn execute(&self, _pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()> {
        if request.request.dependency_replacements.is_empty() {
            return Ok(());
        }
        let dependencies = std::mem::take(&mut request.dependencies);
        request.dependencies =
            replacements::apply(dependencies, &request.request.dependency_replacements)?;
        Ok(())
    }
}
