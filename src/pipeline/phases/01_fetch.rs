use crate::error::Result;
use crate::pipeline::context::{PipelineContext, RequestContext};
use crate::pipeline::phase_trait::WorkflowPhase;
use crate::progress::ProgressEvent;
use async_trait::async_trait;

pub struct FetchPhase;

#[async_trait]
impl WorkflowPhase for FetchPhase {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn reason(&self) -> Option<&'static str> {
        Some("Fetching the application source")
    }

    async fn execute(&self, pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()> {
        let tree = pipeline
            .fetcher
            .fetch(
                &request.request.repo,
                &request.request.git_ref,
                &request.work_dir,
                &request.cancel,
            )
            .await?;

        pipeline.progress.on_progress(&ProgressEvent::SourceReady {
            request_id: request.request_id(),
            cache_hit: tree.cache_hit,
        });
        request.tree = Some(tree);
        Ok(())
    }
}
