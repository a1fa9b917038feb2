//! Long-lived services and per-request state for the pipeline

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::BundleAssembler;
use crate::config::VendorboxConfig;
use crate::error::Result;
use crate::models::{BundleRef, Dependency, Ecosystem, Package, Request};
use crate::progress::{NoOpHandler, ProgressHandler};
use crate::resolvers::{ResolutionResult, ResolverToolkit};
use crate::scm::{SourceFetcher, WorkingTree};
use crate::state::RequestState;
use crate::store::RequestStore;
use crate::tools::CancelSignal;

/// Context that owns all long-lived pipeline dependencies
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn RequestStore>,
    pub fetcher: SourceFetcher,
    pub toolkit: ResolverToolkit,
    pub assembler: BundleAssembler,
    pub config: Arc<VendorboxConfig>,
    pub progress: Arc<dyn ProgressHandler>,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn RequestStore>,
        fetcher: SourceFetcher,
        toolkit: ResolverToolkit,
        config: Arc<VendorboxConfig>,
    ) -> Self {
        let assembler = BundleAssembler::new(&config.bundles_dir, config.step_timeout());
        Self {
            store,
            fetcher,
            toolkit,
            assembler,
            config,
            progress: Arc::new(NoOpHandler),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    /// Records a progress reason while the request stays `in_progress`
    pub async fn record_progress(&self, request_id: u64, reason: &str) -> Result<()> {
        self.store
            .compare_and_set_state(
                request_id,
                RequestState::InProgress,
                RequestState::InProgress,
                reason,
                None,
            )
            .await
            .map(|_| ())
    }
}

/// Everything one request accumulates on its way through the phases
pub struct RequestContext {
    pub request: Request,
    /// Private working directory, removed when the pipeline ends
    pub work_dir: PathBuf,
    pub cancel: CancelSignal,
    pub tree: Option<WorkingTree>,
    pub results: BTreeMap<Ecosystem, ResolutionResult>,
    pub packages: BTreeSet<Package>,
    pub dependencies: BTreeSet<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
    pub path_variables: BTreeSet<String>,
    pub bundle: Option<BundleRef>,
}

impl RequestContext {
    pub fn new(request: Request, work_root: &std::path::Path, cancel: CancelSignal) -> Self {
        let work_dir = work_root.join(request.id.to_string());
        Self {
            request,
            work_dir,
            cancel,
            tree: None,
            results: BTreeMap::new(),
            packages: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            environment_variables: BTreeMap::new(),
            path_variables: BTreeSet::new(),
            bundle: None,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request.id
    }

    /// Where `ecosystem` stages the sources it downloads
    pub fn staging_dir(&self, ecosystem: Ecosystem) -> PathBuf {
        self.work_dir.join("deps").join(ecosystem.tag())
    }
}
