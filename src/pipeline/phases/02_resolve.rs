use crate::error::{Result, VendorError};
use crate::models::Ecosystem;
use crate::pipeline::context::{PipelineContext, RequestContext};
use crate::pipeline::phase_trait::WorkflowPhase;
use crate::progress::ProgressEvent;
use crate::replacements;
use crate::resolvers::{EcosystemResolver, ResolutionResult, ResolveOptions, Resolver};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::time::Instant;
use tracing::debug;

/// Resolves every requested ecosystem concurrently; the first failure ends the phase
pub struct ResolvePhase;

pub fn progress_reason(ecosystem: Ecosystem) -> String {
    format!("Fetching the {} dependencies", ecosystem)
}

#[async_trait]
impl WorkflowPhase for ResolvePhase {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn execute(&self, pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()> {
        let tree = request.tree.as_ref().ok_or_else(|| {
            VendorError::Internal("dependencies resolved before the source was fetched".into())
        })?;
        let request_id = request.request_id();

        let resolutions = request.request.pkg_managers.iter().map(|&ecosystem| {
            let resolver = EcosystemResolver::for_ecosystem(ecosystem, &pipeline.toolkit);
            let options = ResolveOptions {
                staging_dir: request.staging_dir(ecosystem),
                git_ref: request.request.git_ref.clone(),
                flags: request.request.flags.clone(),
                pins: replacements::pins_for(&request.request.dependency_replacements, ecosystem),
                timeout: pipeline.config.step_timeout(),
                cancel: request.cancel.clone(),
            };
            async move {
                pipeline
                    .record_progress(request_id, &progress_reason(ecosystem))
                    .await?;
                let start = Instant::now();
                let result = resolver.resolve(tree, &options).await?;
                pipeline.progress.on_progress(&ProgressEvent::EcosystemResolved {
                    request_id,
                    ecosystem,
                    dependencies: result.dependencies.len(),
                    duration: start.elapsed(),
                });
                Ok::<(Ecosystem, ResolutionResult), VendorError>((ecosystem, result))
            }
        });

        let resolved = try_join_all(resolutions).await?;
        debug!(request_id, ecosystems = resolved.len(), "All ecosystems resolved");
        request.results = resolved.into_iter().collect();
        Ok(())
    }
}
