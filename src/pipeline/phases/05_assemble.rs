use crate::bundle::{AssemblyInput, BundleManifest};
use crate::error::{Result, VendorError};
use crate::pipeline::context::{PipelineContext, RequestContext};
use crate::pipeline::phase_trait::WorkflowPhase;
use crate::progress::ProgressEvent;
use async_trait::async_trait;

pub struct AssemblePhase;

impl AssemblePhase {
    fn input(request: &RequestContext) -> Result<AssemblyInput> {
        let tree = request.tree.as_ref().ok_or_else(|| {
            VendorError::Internal("bundle assembled before the source was fetched".into())
        })?;
        Ok(AssemblyInput {
            source_root: tree.root.clone(),
            staged: request
                .results
                .keys()
                .map(|&ecosystem| (ecosystem, request.staging_dir(ecosystem)))
                .collect(),
            manifest: BundleManifest {
                repo: request.request.repo.clone(),
                git_ref: request.request.git_ref.clone(),
                packages: request.packages.iter().cloned().collect(),
                dependencies: request.dependencies.iter().cloned().collect(),
                environment_variables: request.environment_variables.clone(),
                path_variables: request.path_variables.clone(),
            },
        })
    }
}

#[async_trait]
impl WorkflowPhase for AssemblePhase {
    fn name(&self) -> &'static str {
        "assemble"
    }

    fn reason(&self) -> Option<&'static str> {
        Some("Assembling the bundle")
    }

    async fn execute(&self, pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()> {
        let input = Self::input(request)?;
        let bundle = pipeline
            .assembler
            .assemble(request.request_id(), input, &request.cancel)
            .await?;
        pipeline.progress.on_progress(&ProgressEvent::BundlePublished {
            request_id: request.request_id(),
            sha256: bundle.sha256.clone(),
            size: bundle.size,
        });
        request.bundle = Some(bundle);
        Ok(())
    }
}
