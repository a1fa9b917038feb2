use super::context::{PipelineContext, RequestContext};
use super::phase_trait::WorkflowPhase;
use super::phases::{AssemblePhase, FetchPhase, MergePhase, ReplacePhase, ResolvePhase};
use crate::error::{Result, ToolError, VendorError};
use crate::models::Request;
use crate::progress::ProgressEvent;
use crate::state::RequestState;
use crate::store::Resolution;
use crate::tools::CancelSignal;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const COMPLETED_REASON: &str = "Completed successfully";

pub struct PipelineOrchestrator {
    context: PipelineContext,
}

impl PipelineOrchestrator {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    fn workflow_phases() -> Vec<Box<dyn WorkflowPhase>> {
        vec![
            Box::new(FetchPhase),
            Box::new(ResolvePhase),
            Box::new(MergePhase),
            Box::new(ReplacePhase),
            Box::new(AssemblePhase),
        ]
    }

    /// Runs the request to a terminal state and returns the stored record
    ///
    /// Pipeline failures are recorded on the request, not returned. An `Err` means the
    /// request could not be loaded or its final state could not be written.
    pub async fn process(&self, request_id: u64, cancel: CancelSignal) -> Result<Request> {
        let request = self
            .context
            .store
            .get(request_id)
            .await?
            .ok_or_else(|| {
                VendorError::NotFound(format!("The request {} does not exist", request_id))
            })?;
        if request.state() != RequestState::InProgress {
            debug!(request_id, state = %request.state(), "Request is not in progress, skipping");
            return Ok(request);
        }

        let start = Instant::now();
        self.context.progress.on_progress(&ProgressEvent::Started {
            request_id,
            repo: request.repo.clone(),
            git_ref: request.git_ref.clone(),
        });

        let mut request = RequestContext::new(request, &self.context.config.work_dir, cancel);
        let outcome = self.run_phases(&mut request).await;
        self.cleanup(&request).await;

        match outcome {
            Ok(()) => {
                let resolution = Resolution {
                    packages: std::mem::take(&mut request.packages),
                    dependencies: std::mem::take(&mut request.dependencies),
                    environment_variables: std::mem::take(&mut request.environment_variables),
                    path_variables: std::mem::take(&mut request.path_variables),
                    bundle: request.bundle.take(),
                };
                let stored = self
                    .context
                    .store
                    .finalize(request_id, resolution, COMPLETED_REASON)
                    .await?;
                self.context.progress.on_progress(&ProgressEvent::Completed {
                    request_id,
                    total_time: start.elapsed(),
                });
                Ok(stored)
            }
            Err(err) => self.fail(request_id, err).await,
        }
    }

    async fn run_phases(&self, request: &mut RequestContext) -> Result<()> {
        let request_id = request.request_id();
        for phase in Self::workflow_phases() {
            request.cancel.check()?;
            let reason = phase.reason().map(str::to_string).unwrap_or_default();
            if let Some(reason) = phase.reason() {
                self.context.record_progress(request_id, reason).await?;
            }
            self.context.progress.on_progress(&ProgressEvent::PhaseStarted {
                request_id,
                phase: phase.name(),
                reason,
            });

            let phase_start = Instant::now();
            phase.execute(&self.context, request).await?;

            self.context.progress.on_progress(&ProgressEvent::PhaseCompleted {
                request_id,
                phase: phase.name(),
                duration: phase_start.elapsed(),
            });
        }
        Ok(())
    }

    async fn fail(&self, request_id: u64, err: VendorError) -> Result<Request> {
        let reason = err.user_message();
        match &err {
            VendorError::Tool(ToolError::Failed { program, stderr, .. }) => {
                error!(request_id, program = %program, "External command failed");
                debug!(request_id, %stderr, "Command output");
            }
            VendorError::Io(detail) | VendorError::Internal(detail) => {
                error!(request_id, detail = %detail, "Request failed unexpectedly");
            }
            other => info!(request_id, error = %other, "Request failed"),
        }

        let stored = self
            .context
            .store
            .compare_and_set_state(
                request_id,
                RequestState::InProgress,
                RequestState::Failed,
                &reason,
                None,
            )
            .await;
        match stored {
            Ok(stored) => {
                self.context
                    .progress
                    .on_progress(&ProgressEvent::Failed { request_id, reason });
                Ok(stored)
            }
            Err(VendorError::InvalidState(message)) => {
                // Someone else moved the request on, e.g. the stale sweep
                warn!(request_id, %message, "Could not record the failure");
                self.context
                    .store
                    .get(request_id)
                    .await?
                    .ok_or_else(|| {
                        VendorError::NotFound(format!("The request {} does not exist", request_id))
                    })
            }
            Err(other) => Err(other),
        }
    }

    async fn cleanup(&self, request: &RequestContext) {
        if request.work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&request.work_dir).await {
                warn!(
                    request_id = request.request_id(),
                    path = %request.work_dir.display(),
                    error = %e,
                    "Failed to remove the working directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::config::VendorboxConfig;
    use crate::models::{Ecosystem, NewRequest, Replacement};
    use crate::progress::RecordingHandler;
    use crate::resolvers::ResolverToolkit;
    use crate::scm::SourceFetcher;
    use crate::store::{InMemoryRequestStore, RequestStore};
    use crate::tools::{MockFetcher, MockRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    const REF: &str = "0123456789abcdef0123456789abcdef01234567";

    struct Harness {
        _dir: TempDir,
        store: Arc<InMemoryRequestStore>,
        fetcher: Arc<MockFetcher>,
        progress: Arc<RecordingHandler>,
        orchestrator: PipelineOrchestrator,
        config: Arc<VendorboxConfig>,
    }

    fn harness(runner: MockRunner) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = VendorboxConfig::rooted_at(dir.path());
        config.fetch_retries = 0;
        let config = Arc::new(config);
        let store = Arc::new(InMemoryRequestStore::new());
        let runner = Arc::new(runner);
        let fetcher = Arc::new(MockFetcher::new());
        let progress = Arc::new(RecordingHandler::new());
        let context = PipelineContext::new(
            store.clone(),
            SourceFetcher::new(SourceCache::new(&config.sources_dir), runner.clone(), &config),
            ResolverToolkit {
                runner,
                fetcher: fetcher.clone(),
                config: config.clone(),
            },
            config.clone(),
        )
        .with_progress(progress.clone());
        Harness {
            _dir: dir,
            store,
            fetcher,
            progress,
            orchestrator: PipelineOrchestrator::new(context),
            config,
        }
    }

    fn npm_request(replacements: Vec<Replacement>) -> NewRequest {
        NewRequest {
            repo: "https://github.com/org/web".into(),
            git_ref: REF.into(),
            pkg_managers: [Ecosystem::Npm].into_iter().collect(),
            flags: Default::default(),
            dependency_replacements: replacements,
            submitted_by: None,
            user: None,
        }
    }

    const LOCKFILE: &str = r#"{
        "name": "web",
        "version": "1.0.0",
        "lockfileVersion": 3,
        "packages": {
            "": {"name": "web", "version": "1.0.0"},
            "node_modules/left-pad": {
                "version": "1.3.0",
                "resolved": "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"
            }
        }
    }"#;

    fn npm_runner() -> MockRunner {
        MockRunner::serving_git_tree(&[
            ("package.json", r#"{"name": "web", "version": "1.0.0"}"#),
            ("package-lock.json", LOCKFILE),
        ])
    }

    #[tokio::test]
    async fn test_successful_request_completes() {
        let h = harness(npm_runner());
        h.fetcher.add_file(
            "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz",
            b"left-pad tarball".to_vec(),
        );
        let request = h.store.insert(npm_request(vec![])).await.unwrap();

        let done = h
            .orchestrator
            .process(request.id, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(done.state(), RequestState::Complete);
        assert_eq!(done.state_reason(), COMPLETED_REASON);
        assert_eq!(done.dependencies.len(), 1);
        assert!(done.bundle.is_some());
        assert!(done.state_history.is_monotonic());
        let reasons: Vec<&str> = done
            .state_history
            .entries()
            .iter()
            .map(|t| t.state_reason.as_str())
            .collect();
        assert!(reasons.contains(&"Fetching the application source"));
        assert!(reasons.contains(&"Fetching the npm dependencies"));
        assert!(reasons.contains(&"Assembling the bundle"));
        assert_eq!(
            h.progress.phases(request.id),
            vec!["fetch", "resolve", "merge", "replace", "assemble"]
        );
        assert!(!h.config.work_dir.join(request.id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_unmatched_replacement_fails_request() {
        let h = harness(npm_runner());
        h.fetcher.add_file(
            "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz",
            b"left-pad tarball".to_vec(),
        );
        let replacement = Replacement::new("left-pad", Ecosystem::Npm, "9.9.9", "pad-left");
        let request = h.store.insert(npm_request(vec![replacement])).await.unwrap();

        let done = h
            .orchestrator
            .process(request.id, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(done.state(), RequestState::Failed);
        assert!(done.state_reason().contains("npm:left-pad@9.9.9"));
        assert!(done.bundle.is_none());
        assert!(!h.config.bundles_dir.join(format!("{}.tar.gz", request.id)).exists());
    }

    #[tokio::test]
    async fn test_tool_output_is_not_recorded() {
        let runner = MockRunner::new();
        runner.failing("git", "fetch", "fatal: secret-token@github.com refused");
        let h = harness(runner);
        let request = h.store.insert(npm_request(vec![])).await.unwrap();

        let done = h
            .orchestrator
            .process(request.id, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(done.state(), RequestState::Failed);
        assert!(!done.state_reason().contains("secret-token"));
    }

    #[tokio::test]
    async fn test_cancelled_request_fails_with_admin_reason() {
        let h = harness(npm_runner());
        let request = h.store.insert(npm_request(vec![])).await.unwrap();
        let registry = crate::tools::CancellationRegistry::new();
        let signal = registry.register(request.id);
        assert!(registry.cancel(request.id));

        let done = h.orchestrator.process(request.id, signal).await.unwrap();
        assert_eq!(done.state(), RequestState::Failed);
        assert_eq!(done.state_reason(), "Cancelled by an administrator");
    }

    #[tokio::test]
    async fn test_terminal_request_is_left_alone() {
        let h = harness(npm_runner());
        let request = h.store.insert(npm_request(vec![])).await.unwrap();
        h.store
            .compare_and_set_state(
                request.id,
                RequestState::InProgress,
                RequestState::Stale,
                "The request has become stale",
                None,
            )
            .await
            .unwrap();

        let done = h
            .orchestrator
            .process(request.id, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(done.state(), RequestState::Stale);
        assert!(h.progress.events().is_empty());
    }
}
