//! Fetching application sources from version control
//!
//! A fetch validates the revision, consults the [`SourceCache`], and on a miss checks
//! the revision out with the selected VCS client, snapshots the tree into the cache,
//! and finally extracts a private copy into the request's working directory.
//! Git checkouts start from the newest cached history of the same repository, so a
//! new revision only transfers the objects that history lacks.

pub mod git;
pub mod hg;

use crate::archive::{self, DeterministicArchive, VCS_METADATA_DIRS};
use crate::cache::{CacheEntry, CacheKey, SourceCache};
use crate::config::VendorboxConfig;
use crate::error::{Result, ToolError, VendorError};
use crate::tools::{CancelSignal, CommandRunner, CommandSpec, RetryPolicy};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[0-9a-f]{40}$").expect("valid regex"))
}

/// Accepts only full, lowercase, 40 character commit identifiers
pub fn validate_ref(git_ref: &str) -> Result<()> {
    if ref_pattern().is_match(git_ref) {
        Ok(())
    } else {
        Err(VendorError::InvalidInput(format!(
            "The \"ref\" parameter must be a 40 character hex string, got \"{}\"",
            git_ref
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsBackend {
    Git,
    Mercurial,
}

impl VcsBackend {
    pub fn detect(repo: &str) -> Self {
        if repo.starts_with("hg+") || repo.starts_with("hg://") {
            return VcsBackend::Mercurial;
        }
        let host_is_hg = Url::parse(repo)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.split('.').next() == Some("hg")))
            .unwrap_or(false);
        if host_is_hg {
            VcsBackend::Mercurial
        } else {
            VcsBackend::Git
        }
    }

    /// The URL handed to the VCS client
    pub fn client_url<'a>(&self, repo: &'a str) -> &'a str {
        match self {
            VcsBackend::Mercurial => repo.strip_prefix("hg+").unwrap_or(repo),
            VcsBackend::Git => repo,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VcsBackend::Git => "git",
            VcsBackend::Mercurial => "hg",
        }
    }
}

/// Where a repository lives, as used for cache placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub host: String,
    pub name: String,
}

impl RepoLocation {
    pub fn parse(repo: &str) -> Result<Self> {
        let invalid = || VendorError::InvalidInput(format!("The repo URL \"{}\" is not valid", repo));
        let stripped = repo.strip_prefix("hg+").unwrap_or(repo);

        let (host, path) = match Url::parse(stripped) {
            Ok(url) => (
                url.host_str().unwrap_or("local").to_string(),
                url.path().to_string(),
            ),
            // scp-like `user@host:path`
            Err(_) => {
                let (authority, path) = stripped.split_once(':').ok_or_else(invalid)?;
                let host = authority.rsplit('@').next().unwrap_or(authority);
                (host.to_string(), path.to_string())
            }
        };

        let name = repo_name(&path);
        let unsafe_segment = |s: &str| s.is_empty() || s == "." || s == "..";
        if host.is_empty()
            || name.is_empty()
            || name.split('/').any(unsafe_segment)
            || unsafe_segment(&host)
        {
            return Err(invalid());
        }
        Ok(Self { host, name })
    }

    pub fn cache_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(&self.host);
        for segment in self.name.split('/') {
            dir.push(segment);
        }
        dir
    }
}

/// Repository name from a URL path: surrounding slashes and a `.git` suffix removed
pub fn repo_name(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
}

/// A private checkout of the requested revision
#[derive(Debug, Clone)]
pub struct WorkingTree {
    /// Directory holding the application source (`<dest>/app`)
    pub root: PathBuf,
    pub repo: String,
    pub revision: String,
    pub snapshot: CacheEntry,
    pub cache_hit: bool,
}

#[derive(Clone)]
pub struct SourceFetcher {
    cache: SourceCache,
    runner: Arc<dyn CommandRunner>,
    git_bin: String,
    hg_bin: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(cache: SourceCache, runner: Arc<dyn CommandRunner>, config: &VendorboxConfig) -> Self {
        Self {
            cache,
            runner,
            git_bin: config.git_bin.clone(),
            hg_bin: config.hg_bin.clone(),
            retry: RetryPolicy::new(config.fetch_retries, config.retry_base_ms),
            timeout: config.step_timeout(),
        }
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    /// Places the requested revision's tree under `dest/app`
    pub async fn fetch(
        &self,
        repo: &str,
        revision: &str,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<WorkingTree> {
        validate_ref(revision)?;
        let backend = VcsBackend::detect(repo);
        debug!(repo, revision, backend = backend.name(), "Fetching application source");

        let key = CacheKey::new(repo, revision);
        let scratch = dest.with_extension("checkout");
        let (snapshot, cache_hit) = self
            .cache
            .get_or_populate(&key, |staging| async move {
                let result = self
                    .checkout_and_snapshot(backend, repo, revision, &scratch, &staging, cancel)
                    .await;
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                result
            })
            .await?;

        let archive_file = snapshot.archive.clone();
        let extract_to = dest.to_path_buf();
        cancel
            .guard(
                "extracting the source snapshot",
                self.timeout,
                blocking(move || archive::extract(&archive_file, &extract_to)),
            )
            .await?;

        info!(repo, revision, cache_hit, "Application source is ready");
        Ok(WorkingTree {
            root: dest.join("app"),
            repo: repo.to_string(),
            revision: revision.to_string(),
            snapshot,
            cache_hit,
        })
    }

    async fn checkout_and_snapshot(
        &self,
        backend: VcsBackend,
        repo: &str,
        revision: &str,
        scratch: &Path,
        staging: &Path,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let url = backend.client_url(repo);
        let seed = match backend {
            VcsBackend::Git => self.cache.newest_history(repo)?,
            VcsBackend::Mercurial => None,
        };
        let seed = seed.as_deref();
        self.retry
            .run("fetching the application source", move || async move {
                if scratch.exists() {
                    tokio::fs::remove_dir_all(scratch)
                        .await
                        .map_err(|e| VendorError::io(scratch.display(), e))?;
                }
                tokio::fs::create_dir_all(scratch)
                    .await
                    .map_err(|e| VendorError::io(scratch.display(), e))?;
                match backend {
                    VcsBackend::Git => {
                        let seeded = match seed {
                            Some(history) => self.seed_checkout(history, scratch, cancel).await?,
                            None => false,
                        };
                        let vcs = self.vcs(&self.git_bin, cancel);
                        git::checkout(vcs, url, revision, scratch, seeded).await
                    }
                    VcsBackend::Mercurial => {
                        hg::checkout(self.vcs(&self.hg_bin, cancel), url, revision, scratch).await
                    }
                }
            })
            .await?;

        if backend == VcsBackend::Git && scratch.join(".git").is_dir() {
            let key = CacheKey::new(repo, revision);
            if let Err(err) = self.save_history(&key, scratch, cancel).await {
                warn!(repo, revision, error = %err, "Could not cache the repository history");
            }
        }

        let tree = scratch.to_path_buf();
        let output = staging.to_path_buf();
        cancel
            .guard(
                "archiving the application source",
                self.timeout,
                blocking(move || write_snapshot(&tree, &output)),
            )
            .await
    }

    /// Unpacks a cached `.git` into the empty scratch directory
    async fn seed_checkout(
        &self,
        history: &Path,
        scratch: &Path,
        cancel: &CancelSignal,
    ) -> Result<bool> {
        let (archive_file, dest) = (history.to_path_buf(), scratch.to_path_buf());
        let outcome = cancel
            .guard(
                "seeding the checkout",
                self.timeout,
                blocking(move || archive::extract(&archive_file, &dest)),
            )
            .await;
        match outcome {
            Ok(()) => {
                debug!(history = %history.display(), "Seeded the checkout from cached history");
                Ok(true)
            }
            Err(VendorError::Cancelled) => Err(VendorError::Cancelled),
            Err(err) => {
                warn!(history = %history.display(), error = %err, "Ignoring unusable cached history");
                let git_dir = scratch.join(".git");
                if git_dir.exists() {
                    tokio::fs::remove_dir_all(&git_dir)
                        .await
                        .map_err(|e| VendorError::io(git_dir.display(), e))?;
                }
                Ok(false)
            }
        }
    }

    async fn save_history(&self, key: &CacheKey, scratch: &Path, cancel: &CancelSignal) -> Result<()> {
        let staging = self.cache.staging_path(".git.tar.gz.part")?;
        let (git_dir, output) = (scratch.join(".git"), staging.clone());
        let written = cancel
            .guard(
                "archiving the repository history",
                self.timeout,
                blocking(move || write_history(&git_dir, &output)),
            )
            .await;
        match written {
            Ok(()) => self.cache.publish_history(key, &staging),
            Err(err) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(err)
            }
        }
    }

    fn vcs<'a>(&'a self, program: &'a str, cancel: &'a CancelSignal) -> Vcs<'a> {
        Vcs {
            runner: self.runner.as_ref(),
            program,
            timeout: self.timeout,
            cancel,
        }
    }
}

/// One VCS client bound to a request's timeout and cancellation
pub struct Vcs<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a str,
    timeout: Duration,
    cancel: &'a CancelSignal,
}

impl<'a> Vcs<'a> {
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.program, self.timeout)
    }

    /// Runs the command; a failure becomes `on_failure` so it can be retried
    pub async fn run(&self, spec: CommandSpec, on_failure: impl Into<String>) -> Result<String> {
        let step = spec.display();
        let outcome = self
            .cancel
            .guard(&step, self.timeout, async {
                self.runner.run(&spec).await.map_err(VendorError::from)
            })
            .await;
        match outcome {
            Ok(output) => Ok(output.stdout),
            Err(VendorError::Tool(ToolError::Timeout { seconds, .. })) => {
                Err(VendorError::Timeout { step, seconds })
            }
            Err(VendorError::Tool(ToolError::Failed { stderr, .. })) => {
                debug!(command = %step, %stderr, "VCS command failed");
                Err(VendorError::Fetch(on_failure.into()))
            }
            Err(other) => Err(other),
        }
    }
}

fn write_snapshot(tree: &Path, output: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(output)?;
    let mut writer = DeterministicArchive::new(file);
    writer.append_tree("app", tree, VCS_METADATA_DIRS)?;
    writer.finish()?;
    Ok(())
}

fn write_history(git_dir: &Path, output: &Path) -> anyhow::Result<()> {
    let mut writer = DeterministicArchive::new(std::fs::File::create(output)?);
    writer.append_tree(".git", git_dir, &[])?;
    writer.finish()?;
    Ok(())
}

/// Runs a filesystem-heavy closure on the blocking pool
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VendorError::Internal(format!("Blocking task failed: {}", e)))?
        .map_err(VendorError::from)
}
