//! pip: replays hash-pinned requirement files from source distributions
//!
//! Source distributions are staged flat in `deps/pip` so one find-links directory
//! serves every requirement.

use super::{
    is_plain_segment, read_optional, staging_target, write_staged, ResolutionResult,
    ResolveOptions, Resolver, StagedSource,
};
use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, Package};
use crate::scm::WorkingTree;
use crate::tools::ArtifactFetcher;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

pub const REQUIREMENT_FILES: &[&str] = &["requirements.txt", "requirements-build.txt"];

/// PEP 503 name normalization
pub fn normalize_name(name: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS
        .get_or_init(|| Regex::new(r"[-_.]+").expect("valid regex"))
        .replace_all(&name.to_lowercase(), "-")
        .to_string()
}

fn requirement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)\s*(\[[^\]]*\])?\s*==\s*([A-Za-z0-9][A-Za-z0-9.+!_-]*)$")
            .expect("valid regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedRequirement {
    /// Normalized name
    pub name: String,
    pub version: String,
    /// `algorithm:hex` values from `--hash` options
    pub hashes: Vec<String>,
}

fn rejected(file: &str, line: usize, detail: &str) -> VendorError {
    VendorError::InvalidRepoStructure(format!("{} line {}: {}", file, line, detail))
}

/// Logical lines with continuations joined and comments removed
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    for (number, raw) in content.lines().enumerate() {
        if current.is_empty() {
            start = number + 1;
        }
        let without_comment = match raw.find(" #").or_else(|| raw.starts_with('#').then_some(0)) {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        match without_comment.trim_end().strip_suffix('\\') {
            Some(continued) => {
                current.push_str(continued);
                current.push(' ');
            }
            None => {
                current.push_str(without_comment);
                let line = current.trim().to_string();
                if !line.is_empty() {
                    lines.push((start, line));
                }
                current.clear();
            }
        }
    }
    let line = current.trim().to_string();
    if !line.is_empty() {
        lines.push((start, line));
    }
    lines
}

/// Parses a requirements file in which every requirement must be pinned with `==`
pub fn parse_requirements(file: &str, content: &str) -> Result<Vec<PinnedRequirement>> {
    let mut requirements = Vec::new();
    for (number, line) in logical_lines(content) {
        if line.starts_with('-') {
            return Err(rejected(file, number, &format!("unsupported option \"{}\"", line)));
        }

        let (spec, options) = match line.find(" -") {
            Some(idx) => (line[..idx].trim(), line[idx..].trim()),
            None => (line.as_str(), ""),
        };
        let spec = spec.split(';').next().unwrap_or(spec).trim();
        let caps = requirement_pattern().captures(spec).ok_or_else(|| {
            rejected(file, number, &format!("\"{}\" is not pinned to an exact version", spec))
        })?;

        let mut hashes = Vec::new();
        let mut tokens = options.split_whitespace();
        while let Some(token) = tokens.next() {
            let value = match token.strip_prefix("--hash=") {
                Some(value) => Some(value.to_string()),
                None if token == "--hash" => tokens.next().map(str::to_string),
                None => None,
            };
            match value {
                Some(hash) if hash.contains(':') => hashes.push(hash),
                _ => {
                    return Err(rejected(
                        file,
                        number,
                        &format!("unsupported option \"{}\"", token),
                    ))
                }
            }
        }

        requirements.push(PinnedRequirement {
            name: normalize_name(&caps[1]),
            version: caps[3].to_string(),
            hashes,
        });
    }
    Ok(requirements)
}

/// The project's own name and version from `pyproject.toml` or `setup.cfg`
pub fn project_metadata(root: &Path) -> Result<(String, String)> {
    if let Some(content) = read_optional(root, "pyproject.toml")? {
        let parsed: toml::Value = toml::from_str(&content).map_err(|e| {
            VendorError::InvalidRepoStructure(format!("The pyproject.toml file is invalid: {}", e))
        })?;
        if let Some(project) = parsed.get("project").and_then(|p| p.as_table()) {
            let name = project.get("name").and_then(|v| v.as_str());
            let version = project.get("version").and_then(|v| v.as_str());
            if let (Some(name), Some(version)) = (name, version) {
                return Ok((normalize_name(name), version.to_string()));
            }
        }
    }

    if let Some(content) = read_optional(root, "setup.cfg")? {
        let metadata = ini_section(&content, "metadata");
        if let (Some(name), Some(version)) = (metadata.get("name"), metadata.get("version")) {
            if !version.contains(':') {
                return Ok((normalize_name(name), version.clone()));
            }
        }
    }

    Err(VendorError::InvalidRepoStructure(
        "Unable to determine the package name and version from pyproject.toml or setup.cfg"
            .to_string(),
    ))
}

fn ini_section(content: &str, wanted: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let mut in_section = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.starts_with(';') || trimmed.is_empty() {
            continue;
        }
        if let Some(section) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_section = section.trim() == wanted;
            continue;
        }
        if in_section && !line.starts_with(char::is_whitespace) {
            if let Some((key, value)) = trimmed.split_once('=').or_else(|| trimmed.split_once(':')) {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    values
}

fn digest_hex(algorithm: &str, data: &[u8]) -> Option<String> {
    match algorithm {
        "sha256" => Some(hex::encode(Sha256::digest(data))),
        "sha384" => Some(hex::encode(Sha384::digest(data))),
        "sha512" => Some(hex::encode(Sha512::digest(data))),
        _ => None,
    }
}

/// True when one of the supported listed hashes matches; None when none are supported
fn matches_any(hashes: &[String], data: &[u8]) -> Option<bool> {
    let mut checked = false;
    for hash in hashes {
        let Some((algorithm, expected)) = hash.split_once(':') else {
            continue;
        };
        if let Some(actual) = digest_hex(algorithm, data) {
            checked = true;
            if actual.eq_ignore_ascii_case(expected) {
                return Some(true);
            }
        }
    }
    checked.then_some(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sdist {
    filename: String,
    url: String,
    sha256: Option<String>,
}

fn find_sdist(document: &Value) -> Option<Sdist> {
    document
        .get("urls")?
        .as_array()?
        .iter()
        .find(|file| file.get("packagetype").and_then(Value::as_str) == Some("sdist"))
        .and_then(|file| {
            Some(Sdist {
                filename: file.get("filename")?.as_str()?.to_string(),
                url: file.get("url")?.as_str()?.to_string(),
                sha256: file
                    .get("digests")
                    .and_then(|d| d.get("sha256"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
}

pub struct PipResolver {
    fetcher: Arc<dyn ArtifactFetcher>,
    index_url: String,
}

impl PipResolver {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, index_url: String) -> Self {
        Self {
            fetcher,
            index_url: index_url.trim_end_matches('/').to_string(),
        }
    }

    fn requirements(&self, root: &Path) -> Result<Vec<PinnedRequirement>> {
        let mut found = false;
        let mut merged: BTreeMap<String, PinnedRequirement> = BTreeMap::new();
        for file in REQUIREMENT_FILES {
            let Some(content) = read_optional(root, file)? else {
                continue;
            };
            found = true;
            for requirement in parse_requirements(file, &content)? {
                match merged.get_mut(&requirement.name) {
                    Some(existing) if existing.version != requirement.version => {
                        return Err(VendorError::InvalidRepoStructure(format!(
                            "{} is pinned to both {} and {}",
                            requirement.name, existing.version, requirement.version
                        )))
                    }
                    Some(existing) => existing.hashes.extend(requirement.hashes),
                    None => {
                        merged.insert(requirement.name.clone(), requirement);
                    }
                }
            }
        }
        if !found {
            return Err(VendorError::InvalidRepoStructure(
                "The requirements.txt file must be present in the source repository".to_string(),
            ));
        }
        Ok(merged.into_values().collect())
    }

    async fn stage(
        &self,
        requirement: &PinnedRequirement,
        options: &ResolveOptions,
    ) -> Result<(Package, PathBuf)> {
        let metadata_url = format!(
            "{}/{}/{}/json",
            self.index_url, requirement.name, requirement.version
        );
        let document = options
            .cancel
            .guard(
                &format!("querying {}", metadata_url),
                options.timeout,
                self.fetcher.fetch_json(&metadata_url),
            )
            .await?;
        let sdist = find_sdist(&document).ok_or_else(|| {
            VendorError::InvalidRepoStructure(format!(
                "No source distribution is available for {}=={}",
                requirement.name, requirement.version
            ))
        })?;
        if !is_plain_segment(&sdist.filename) {
            return Err(VendorError::InvalidRepoStructure(format!(
                "The package index returned the invalid file name \"{}\" for {}=={}",
                sdist.filename, requirement.name, requirement.version
            )));
        }
        let relative = PathBuf::from(&sdist.filename);
        let target = staging_target(&options.staging_dir, &relative)?;

        let data = options
            .cancel
            .guard(
                &format!("downloading {}", sdist.url),
                options.timeout,
                self.fetcher.fetch_bytes(&sdist.url, None),
            )
            .await?;
        let sha256 = hex::encode(Sha256::digest(&data));

        let mismatch = || {
            VendorError::Integrity(format!(
                "The checksum of {} does not match the expected hashes",
                sdist.filename
            ))
        };
        if sdist.sha256.as_deref().is_some_and(|d| !d.eq_ignore_ascii_case(&sha256)) {
            return Err(mismatch());
        }
        match matches_any(&requirement.hashes, &data) {
            Some(true) => {}
            Some(false) => return Err(mismatch()),
            None if requirement.hashes.is_empty() => {}
            None => warn!(
                package = %requirement.name,
                "Only unsupported hash algorithms listed, skipping verification"
            ),
        }

        write_staged(&target, &data).await?;
        let package = Package::new(&requirement.name, Ecosystem::Pip, &requirement.version)
            .with_integrity(format!("sha256:{}", sha256));
        Ok((package, relative))
    }
}

#[async_trait]
impl Resolver for PipResolver {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Pip
    }

    async fn resolve(
        &self,
        tree: &WorkingTree,
        options: &ResolveOptions,
    ) -> Result<ResolutionResult> {
        let (name, version) = project_metadata(&tree.root)?;
        let requirements = self.requirements(&tree.root)?;
        info!(package = %name, requirements = requirements.len(), "Resolving pip requirements");

        let mut dependencies = BTreeSet::new();
        let mut staged = Vec::new();
        for requirement in &requirements {
            let (package, path) = self.stage(requirement, options).await?;
            staged.push(StagedSource {
                package: package.clone(),
                path,
            });
            dependencies.insert(Dependency::new(package));
        }

        let mut environment_variables = BTreeMap::new();
        environment_variables.insert("PIP_FIND_LINKS".to_string(), "deps/pip".to_string());
        environment_variables.insert("PIP_NO_INDEX".to_string(), "true".to_string());

        Ok(ResolutionResult {
            packages: [Package::new(name, Ecosystem::Pip, version)].into_iter().collect(),
            dependencies,
            environment_variables,
            path_variables: ["PIP_FIND_LINKS".to_string()].into(),
            staged,
        })
    }
}
