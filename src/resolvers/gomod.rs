//! Go modules: replays `go.mod` + `go.sum` into a module cache

use super::{read_manifest, read_optional, ResolutionResult, ResolveOptions, Resolver, StagedSource};
use crate::config::VendorboxConfig;
use crate::error::{Result, ToolError, VendorError};
use crate::models::{Dependency, Ecosystem, Package, Replacement};
use crate::scm::WorkingTree;
use crate::tools::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoReplace {
    pub old: String,
    pub old_version: Option<String>,
    pub new: String,
    pub new_version: Option<String>,
}

impl GoReplace {
    /// Replacements pointing at a directory are part of the source tree
    pub fn is_local(&self) -> bool {
        self.new.starts_with("./") || self.new.starts_with("../") || self.new.starts_with('/')
    }

    fn applies_to(&self, module: &str, version: &str) -> bool {
        self.old == module && self.old_version.as_deref().map_or(true, |v| v == version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoMod {
    pub module: String,
    pub go_version: Option<String>,
    pub requires: Vec<(String, String)>,
    pub replaces: Vec<GoReplace>,
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

fn unquote(token: &str) -> String {
    token.trim_matches('"').trim_matches('`').to_string()
}

impl GoMod {
    pub fn parse(content: &str) -> Result<Self> {
        let mut go_mod = GoMod::default();
        let mut block: Option<String> = None;

        for (number, raw) in content.lines().enumerate() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if block.is_some() && line == ")" {
                block = None;
                continue;
            }
            let (directive, rest) = match &block {
                Some(name) => (name.clone(), line.to_string()),
                None => {
                    let (directive, rest) = line
                        .split_once(char::is_whitespace)
                        .map(|(d, r)| (d.to_string(), r.trim().to_string()))
                        .unwrap_or_else(|| (line.to_string(), String::new()));
                    if rest == "(" {
                        block = Some(directive);
                        continue;
                    }
                    (directive, rest)
                }
            };

            match directive.as_str() {
                "module" => go_mod.module = unquote(&rest),
                "go" => go_mod.go_version = Some(rest),
                "require" => {
                    let parts: Vec<&str> = rest.split_whitespace().collect();
                    match parts.as_slice() {
                        [module, version] => go_mod
                            .requires
                            .push((unquote(module), version.to_string())),
                        _ => return Err(malformed(number, raw)),
                    }
                }
                "replace" => {
                    let replace = parse_replace(&rest).ok_or_else(|| malformed(number, raw))?;
                    go_mod.replaces.push(replace);
                }
                // exclude, retract, toolchain, godebug
                _ => {}
            }
        }

        if go_mod.module.is_empty() {
            return Err(VendorError::InvalidRepoStructure(
                "The go.mod file does not declare a module".to_string(),
            ));
        }
        Ok(go_mod)
    }

    pub fn required_version(&self, module: &str) -> Option<&str> {
        self.requires
            .iter()
            .find(|(name, _)| name == module)
            .map(|(_, version)| version.as_str())
    }
}

fn malformed(number: usize, line: &str) -> VendorError {
    VendorError::InvalidRepoStructure(format!(
        "The go.mod file has an invalid directive on line {}: {}",
        number + 1,
        line.trim()
    ))
}

fn parse_replace(rest: &str) -> Option<GoReplace> {
    let (old, new) = rest.split_once("=>")?;
    let old: Vec<&str> = old.split_whitespace().collect();
    let new: Vec<&str> = new.split_whitespace().collect();
    let (old, old_version) = match old.as_slice() {
        [module] => (unquote(module), None),
        [module, version] => (unquote(module), Some(version.to_string())),
        _ => return None,
    };
    let (new, new_version) = match new.as_slice() {
        [target] => (unquote(target), None),
        [target, version] => (unquote(target), Some(version.to_string())),
        _ => return None,
    };
    Some(GoReplace {
        old,
        old_version,
        new,
        new_version,
    })
}

/// `h1:` content hashes from `go.sum`, keyed by `(module, version)`
pub fn parse_go_sum(content: &str) -> Result<BTreeMap<(String, String), String>> {
    let mut hashes = BTreeMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [module, version, hash] = parts.as_slice() else {
            return Err(VendorError::InvalidRepoStructure(format!(
                "The go.sum file has an invalid entry on line {}",
                number + 1
            )));
        };
        if version.ends_with("/go.mod") || !hash.starts_with("h1:") {
            continue;
        }
        hashes.insert((module.to_string(), version.to_string()), hash.to_string());
    }
    Ok(hashes)
}

/// Module cache path escaping: every uppercase letter becomes `!` + lowercase
pub fn escape_module_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            escaped.push('!');
            escaped.push(c.to_ascii_lowercase());
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Pseudo-version of the repository's own module at `git_ref`
pub fn top_level_version(git_ref: &str) -> String {
    let short: String = git_ref.chars().take(12).collect();
    format!("v0.0.0-{}", short)
}

fn download_dir(staging: &Path, module: &str) -> PathBuf {
    staging
        .join("pkg/mod/cache/download")
        .join(escape_module_path(module))
        .join("@v")
}

pub struct GomodResolver {
    runner: Arc<dyn CommandRunner>,
    go_bin: String,
    goproxy: String,
    gosumdb: String,
}

impl GomodResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &VendorboxConfig) -> Self {
        Self {
            runner,
            go_bin: config.go_bin.clone(),
            goproxy: config.goproxy.clone(),
            gosumdb: config.gosumdb.clone(),
        }
    }

    fn go(&self, tree: &WorkingTree, options: &ResolveOptions) -> CommandSpec {
        let staging = options.staging_dir.display().to_string();
        CommandSpec::new(&self.go_bin, options.timeout)
            .cwd(&tree.root)
            .env("GOMODCACHE", format!("{}/pkg/mod", staging))
            .env("GOPATH", staging)
            .env("GOFLAGS", "-mod=mod -modcacherw")
            .env("GOPROXY", &self.goproxy)
            .env("GOSUMDB", &self.gosumdb)
            .env("GOTOOLCHAIN", "local")
    }

    async fn run_go(&self, spec: CommandSpec, options: &ResolveOptions) -> Result<()> {
        let step = spec.display();
        let outcome = options
            .cancel
            .guard(&step, options.timeout, async {
                self.runner.run(&spec).await.map_err(VendorError::from)
            })
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(VendorError::Tool(ToolError::Failed { stderr, .. })) => {
                debug!(command = %step, %stderr, "go command failed");
                Err(VendorError::Fetch(
                    "Fetching the gomod dependencies failed".to_string(),
                ))
            }
            Err(other) => Err(other),
        }
    }

    /// Resolved module set before any download
    fn plan(
        &self,
        go_mod: &GoMod,
        sums: &BTreeMap<(String, String), String>,
        pins: &[Replacement],
    ) -> Result<BTreeSet<Dependency>> {
        for (module, version) in &go_mod.requires {
            let replace = go_mod.replaces.iter().find(|r| r.applies_to(module, version));
            let (target, target_version) = match replace {
                Some(r) if r.is_local() => continue,
                Some(r) => (
                    r.new.clone(),
                    r.new_version.clone().unwrap_or_else(|| version.clone()),
                ),
                None => (module.clone(), version.clone()),
            };
            let pinned = pins
                .iter()
                .any(|pin| pin.name == target && pin.version == target_version);
            if !pinned && !sums.contains_key(&(target.clone(), target_version.clone())) {
                return Err(VendorError::InvalidRepoStructure(format!(
                    "The module {}@{} required by go.mod is missing from go.sum",
                    target, target_version
                )));
            }
        }

        let mut dependencies = BTreeSet::new();
        for ((module, version), hash) in sums {
            let package = Package::new(module, Ecosystem::Gomod, version).with_integrity(hash);

            if let Some(pin) = pins.iter().find(|p| p.name == *module && p.version == *version) {
                let mut renamed = Package::new(&pin.new_name, Ecosystem::Gomod, version);
                renamed.integrity = sums.get(&(pin.new_name.clone(), version.clone())).cloned();
                dependencies.insert(Dependency::replacing(renamed, package.clone()));
                continue;
            }

            let original = go_mod.replaces.iter().find(|r| {
                !r.is_local()
                    && r.new == *module
                    && r.new_version.as_deref().map_or(true, |v| v == version)
            });
            let dependency = match original {
                Some(replace) => {
                    let old_version = replace
                        .old_version
                        .clone()
                        .or_else(|| go_mod.required_version(&replace.old).map(str::to_string));
                    match old_version {
                        Some(old_version) => Dependency::replacing(
                            package,
                            Package::new(&replace.old, Ecosystem::Gomod, old_version),
                        ),
                        None => Dependency::new(package),
                    }
                }
                None => Dependency::new(package),
            };
            dependencies.insert(dependency);
        }
        Ok(dependencies)
    }

    fn verify_downloads(
        &self,
        staging: &Path,
        dependencies: &BTreeSet<Dependency>,
    ) -> Result<Vec<StagedSource>> {
        let mut staged = Vec::new();
        for dependency in dependencies {
            let dir = download_dir(staging, dependency.name());
            let version = escape_module_path(dependency.version());
            let ziphash = dir.join(format!("{}.ziphash", version));

            match (&dependency.package.integrity, ziphash.is_file()) {
                (Some(expected), true) => {
                    let actual = std::fs::read_to_string(&ziphash)
                        .map_err(|e| VendorError::io(ziphash.display(), e))?;
                    if actual.trim() != expected {
                        return Err(VendorError::Integrity(format!(
                            "The checksum of {}@{} does not match go.sum",
                            dependency.name(),
                            dependency.version()
                        )));
                    }
                }
                (None, _) => warn!(
                    module = dependency.name(),
                    version = dependency.version(),
                    "No go.sum hash to verify the module against"
                ),
                (Some(_), false) => debug!(
                    module = dependency.name(),
                    version = dependency.version(),
                    "Module was not downloaded, nothing to verify"
                ),
            }

            let zip = dir.join(format!("{}.zip", version));
            if let Ok(relative) = zip.strip_prefix(staging) {
                if zip.is_file() {
                    staged.push(StagedSource {
                        package: dependency.package.clone(),
                        path: relative.to_path_buf(),
                    });
                }
            }
        }
        Ok(staged)
    }
}

#[async_trait]
impl Resolver for GomodResolver {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Gomod
    }

    async fn resolve(
        &self,
        tree: &WorkingTree,
        options: &ResolveOptions,
    ) -> Result<ResolutionResult> {
        let go_mod = GoMod::parse(&read_manifest(&tree.root, "go.mod")?)?;
        let sums = match read_optional(&tree.root, "go.sum")? {
            Some(content) => parse_go_sum(&content)?,
            None => BTreeMap::new(),
        };
        info!(
            module = %go_mod.module,
            requires = go_mod.requires.len(),
            sums = sums.len(),
            "Resolving Go modules"
        );

        let dependencies = self.plan(&go_mod, &sums, &options.pins)?;

        tokio::fs::create_dir_all(&options.staging_dir)
            .await
            .map_err(|e| VendorError::io(options.staging_dir.display(), e))?;
        for pin in &options.pins {
            let edit = format!(
                "-replace={}@{}={}@{}",
                pin.name, pin.version, pin.new_name, pin.version
            );
            self.run_go(self.go(tree, options).args(["mod", "edit", edit.as_str()]), options)
                .await?;
        }
        if !dependencies.is_empty() || !go_mod.requires.is_empty() {
            self.run_go(self.go(tree, options).args(["mod", "download"]), options)
                .await?;
        }

        let staged = self.verify_downloads(&options.staging_dir, &dependencies)?;

        let mut environment_variables = BTreeMap::new();
        for (name, value) in [
            ("GOMODCACHE", "deps/gomod/pkg/mod"),
            ("GOPATH", "deps/gomod"),
            ("GOFLAGS", "-mod=mod"),
            ("GOPROXY", "off"),
        ] {
            environment_variables.insert(name.to_string(), value.to_string());
        }

        let mut packages = BTreeSet::new();
        packages.insert(Package::new(
            &go_mod.module,
            Ecosystem::Gomod,
            top_level_version(&options.git_ref),
        ));

        Ok(ResolutionResult {
            packages,
            dependencies,
            environment_variables,
            path_variables: ["GOMODCACHE", "GOPATH"].map(String::from).into(),
            staged,
        })
    }
}
