//! Per-ecosystem dependency resolution
//!
//! Each resolver replays a lockfile-exact dependency set from the working tree,
//! stages the sources of every dependency below its own staging directory and
//! reports the environment variables that keep the eventual build offline.
//! Resolvers share no state; the pipeline runs them concurrently.

pub mod gomod;
pub mod npm;
pub mod pip;

use crate::config::VendorboxConfig;
use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, Package, Replacement};
use crate::scm::WorkingTree;
use crate::tools::{ArtifactFetcher, CancelSignal, CommandRunner};
use async_trait::async_trait;
use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use gomod::GomodResolver;
pub use npm::NpmResolver;
pub use pip::PipResolver;

/// Feature toggle that leaves development-only dependencies out
pub const SKIP_DEV_DEPENDENCIES: &str = "skip-dev-dependencies";

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// `<work>/deps/<ecosystem>`; bundled as `deps/<ecosystem>`
    pub staging_dir: PathBuf,
    pub git_ref: String,
    pub flags: BTreeSet<String>,
    /// Replacements to honor while resolving
    pub pins: Vec<Replacement>,
    pub timeout: Duration,
    pub cancel: CancelSignal,
}

impl ResolveOptions {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

/// A file staged for the bundle, relative to the ecosystem's staging directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagedSource {
    pub package: Package,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionResult {
    /// Top-level packages defined by the repository itself
    pub packages: BTreeSet<Package>,
    pub dependencies: BTreeSet<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
    /// Variables whose values are paths relative to the bundle root
    pub path_variables: BTreeSet<String>,
    pub staged: Vec<StagedSource>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    async fn resolve(&self, tree: &WorkingTree, options: &ResolveOptions)
        -> Result<ResolutionResult>;
}

/// Shared handles every resolver draws on
#[derive(Clone)]
pub struct ResolverToolkit {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub config: Arc<VendorboxConfig>,
}

/// The closed set of supported ecosystems
pub enum EcosystemResolver {
    Gomod(GomodResolver),
    Npm(NpmResolver),
    Pip(PipResolver),
}

impl EcosystemResolver {
    pub fn for_ecosystem(ecosystem: Ecosystem, toolkit: &ResolverToolkit) -> Self {
        match ecosystem {
            Ecosystem::Gomod => EcosystemResolver::Gomod(GomodResolver::new(
                toolkit.runner.clone(),
                &toolkit.config,
            )),
            Ecosystem::Npm => EcosystemResolver::Npm(NpmResolver::new(
                toolkit.fetcher.clone(),
                toolkit.config.npm_token.clone(),
            )),
            Ecosystem::Pip => EcosystemResolver::Pip(PipResolver::new(
                toolkit.fetcher.clone(),
                toolkit.config.pip_index_url.clone(),
            )),
        }
    }
}

#[async_trait]
impl Resolver for EcosystemResolver {
    fn ecosystem(&self) -> Ecosystem {
        match self {
            EcosystemResolver::Gomod(_) => Ecosystem::Gomod,
            EcosystemResolver::Npm(_) => Ecosystem::Npm,
            EcosystemResolver::Pip(_) => Ecosystem::Pip,
        }
    }

    async fn resolve(
        &self,
        tree: &WorkingTree,
        options: &ResolveOptions,
    ) -> Result<ResolutionResult> {
        match self {
            EcosystemResolver::Gomod(resolver) => resolver.resolve(tree, options).await,
            EcosystemResolver::Npm(resolver) => resolver.resolve(tree, options).await,
            EcosystemResolver::Pip(resolver) => resolver.resolve(tree, options).await,
        }
    }
}

/// Reads a manifest that must exist in the source tree
pub(crate) fn read_manifest(root: &Path, name: &str) -> Result<String> {
    let path = root.join(name);
    if !path.is_file() {
        return Err(VendorError::InvalidRepoStructure(format!(
            "The {} file must be present in the source repository",
            name
        )));
    }
    std::fs::read_to_string(&path).map_err(|e| VendorError::io(path.display(), e))
}

pub(crate) fn read_optional(root: &Path, name: &str) -> Result<Option<String>> {
    let path = root.join(name);
    if !path.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(&path)
        .map(Some)
        .map_err(|e| VendorError::io(path.display(), e))
}

/// Joins a staged file's relative path onto the staging directory
///
/// The path comes from lockfiles and package indexes, so anything but plain
/// components is refused.
pub(crate) fn staging_target(staging_dir: &Path, relative: &Path) -> Result<PathBuf> {
    let plain = relative.components().count() > 0
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(VendorError::InvalidRepoStructure(format!(
            "Refusing to stage \"{}\" outside of the dependency directory",
            relative.display()
        )));
    }
    Ok(staging_dir.join(relative))
}

/// A single path segment taken from untrusted metadata
pub(crate) fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}

pub(crate) async fn write_staged(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VendorError::io(parent.display(), e))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| VendorError::io(path.display(), e))
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Outcome of checking data against a Subresource Integrity string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SriCheck {
    Verified,
    /// Only algorithms this crate cannot compute were listed
    Unsupported,
    Mismatch,
}

/// Verifies `data` against an SRI value such as `sha512-<base64>`
///
/// Several space separated hashes may be given; the strongest supported one decides.
pub fn verify_sri(integrity: &str, data: &[u8]) -> SriCheck {
    let mut best: Option<(u8, &str, &str)> = None;
    for token in integrity.split_whitespace() {
        let Some((algorithm, digest)) = token.split_once('-') else {
            continue;
        };
        let strength = match algorithm {
            "sha512" => 3,
            "sha256" => 2,
            "sha1" => 1,
            _ => continue,
        };
        if best.map_or(true, |(s, _, _)| strength > s) {
            best = Some((strength, algorithm, digest));
        }
    }

    let Some((_, algorithm, expected)) = best else {
        return SriCheck::Unsupported;
    };
    let actual = match algorithm {
        "sha512" => Sha512::digest(data).to_vec(),
        "sha256" => Sha256::digest(data).to_vec(),
        _ => Sha1::digest(data).to_vec(),
    };
    let expected = expected.split('?').next().unwrap_or(expected);
    let encoded = base64::engine::general_purpose::STANDARD.encode(actual);
    if encoded == expected {
        SriCheck::Verified
    } else {
        SriCheck::Mismatch
    }
}
