//! Shared setup for the integration suites: a service wired to a worker pool that
//! talks to scripted tools instead of the network.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vendorbox::api::{Caller, NewRequestBody, Privilege, RequestService};
use vendorbox::cache::SourceCache;
use vendorbox::pipeline::{PipelineContext, PipelineOrchestrator};
use vendorbox::progress::RecordingHandler;
use vendorbox::resolvers::ResolverToolkit;
use vendorbox::scm::SourceFetcher;
use vendorbox::store::InMemoryRequestStore;
use vendorbox::tools::{CommandOutput, MockFetcher, MockRunner};
use vendorbox::{VendorboxConfig, WorkerPool};

pub const REF: &str = "4f2c8d1e9a7b6c5d4e3f2a1b0c9d8e7f6a5b4c3d";

pub const GO_MOD: &str = "module example.com/app\n\ngo 1.21\n\nrequire rsc.io/quote v1.5.2\n";

pub const GO_SUM: &str = "rsc.io/quote v1.5.2 h1:w5fcysjrx7yqtD/aO+QwRjYZOKnaM9Uh2b40tElTs3Y=\n\
rsc.io/quote v1.5.2/go.mod h1:LzX7hefJvL54yjefDEDHNONDjII0t9xZLPXsUe+TKr0=\n";

pub const QUOTE_HASH: &str = "h1:w5fcysjrx7yqtD/aO+QwRjYZOKnaM9Uh2b40tElTs3Y=";

#[allow(dead_code)]
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<VendorboxConfig>,
    pub store: Arc<InMemoryRequestStore>,
    pub runner: Arc<MockRunner>,
    pub fetcher: Arc<MockFetcher>,
    pub progress: Arc<RecordingHandler>,
    pub service: RequestService,
    pool: Option<WorkerPool>,
}

impl Harness {
    pub fn new(runner: MockRunner, workers: usize) -> Self {
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
                runner: runner.clone(),
                fetcher: fetcher.clone(),
                config: config.clone(),
            },
            config.clone(),
        )
        .with_progress(progress.clone());

        let (queue, pool) =
            WorkerPool::start(Arc::new(PipelineOrchestrator::new(context)), workers);
        let service = RequestService::new(store.clone(), queue, config.clone());

        Self {
            dir,
            config,
            store,
            runner,
            fetcher,
            progress,
            service,
            pool: Some(pool),
        }
    }

    /// Waits until every submitted request has been processed
    pub async fn drain(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.config.bundles_dir.clone()
    }
}

pub fn alice() -> Caller {
    Caller::user("alice")
}

#[allow(dead_code)]
pub fn admin() -> Caller {
    Caller::user("operator").with_privilege(Privilege::Administer)
}

pub fn body(value: serde_json::Value) -> NewRequestBody {
    NewRequestBody::from_json(value).unwrap()
}

/// A git tree holding a Go module whose `go mod download` fills the module cache
pub fn gomod_runner() -> MockRunner {
    let runner = MockRunner::serving_git_tree(&[("go.mod", GO_MOD), ("go.sum", GO_SUM)]);
    runner.on("go", Some("mod"), |spec| {
        if spec.args.get(1).map(String::as_str) == Some("download") {
            let cache = PathBuf::from(&spec.env["GOMODCACHE"]);
            let dir = cache.join("cache/download/rsc.io/quote/@v");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("v1.5.2.zip"), b"quote module zip").unwrap();
            std::fs::write(dir.join("v1.5.2.ziphash"), format!("{}\n", QUOTE_HASH)).unwrap();
            std::fs::write(dir.join("v1.5.2.mod"), "module rsc.io/quote\n").unwrap();
        }
        Ok(CommandOutput::default())
    });
    runner
}
