//! npm: replays `package-lock.json` and stages every registry tarball
//!
//! The lockfile in the working tree is rewritten so each staged package resolves to
//! its bundled tarball (`file:../deps/npm/...`), which lets an offline `npm ci` run
//! from `app/`.

use super::{
    is_plain_segment, read_manifest, staging_target, verify_sri, write_staged, ResolutionResult,
    ResolveOptions, Resolver, SriCheck, StagedSource, SKIP_DEV_DEPENDENCIES,
};
use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, Package};
use crate::scm::WorkingTree;
use crate::tools::ArtifactFetcher;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One package pinned by the lockfile
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub dev: bool,
}

impl LockedPackage {
    pub fn is_registry(&self) -> bool {
        self.resolved
            .as_deref()
            .map_or(false, |r| r.starts_with("https://") || r.starts_with("http://"))
    }

    /// `<name>/-/<basename>-<version>.tgz`, scoped names keep their scope directory
    ///
    /// Names must be `name` or `@scope/name`; anything else could leave the staging
    /// directory.
    pub fn staged_path(&self) -> Result<String> {
        let basename = match self.name.strip_prefix('@').map(|scoped| scoped.split_once('/')) {
            Some(Some((scope, name))) if is_plain_segment(scope) && is_plain_segment(name) => name,
            None if is_plain_segment(&self.name) => self.name.as_str(),
            _ => {
                return Err(invalid_lockfile(&format!(
                    "\"{}\" is not a valid package name",
                    self.name
                )))
            }
        };
        let file = format!("{}-{}.tgz", basename, self.version);
        if !is_plain_segment(&file) {
            return Err(invalid_lockfile(&format!(
                "\"{}\" is not a valid version of {}",
                self.version, self.name
            )));
        }
        Ok(format!("{}/-/{}", self.name, file))
    }
}

/// Location of the staging directory as seen from `app/`
const BUNDLED_FROM_APP: &str = "../deps/npm";

/// Points every `resolved` URL found in `bundled` at its tarball, returning the count
pub fn rewrite_resolved(node: &mut Value, bundled: &BTreeMap<String, String>) -> usize {
    match node {
        Value::Object(map) => {
            let mut rewritten = 0;
            for (key, value) in map.iter_mut() {
                if key == "resolved" {
                    if let Some(local) = value.as_str().and_then(|url| bundled.get(url)) {
                        *value = Value::String(local.clone());
                        rewritten += 1;
                        continue;
                    }
                }
                rewritten += rewrite_resolved(value, bundled);
            }
            rewritten
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_resolved(item, bundled))
            .sum(),
        _ => 0,
    }
}

fn str_field(entry: &Value, field: &str) -> Option<String> {
    entry.get(field).and_then(Value::as_str).map(str::to_string)
}

fn invalid_lockfile(detail: &str) -> VendorError {
    VendorError::InvalidRepoStructure(format!("The package-lock.json file is invalid: {}", detail))
}

/// Name of a `packages` entry keyed `node_modules/.../node_modules/<name>`
fn name_from_key(key: &str) -> Option<&str> {
    key.rfind("node_modules/")
        .map(|idx| &key[idx + "node_modules/".len()..])
}

fn read_lockfile(content: &str) -> Result<Value> {
    serde_json::from_str(content).map_err(|e| invalid_lockfile(&e.to_string()))
}

/// Flattens the lockfile, deduplicated by `(name, version)`
pub fn parse_lockfile(content: &str) -> Result<Vec<LockedPackage>> {
    locked_packages(&read_lockfile(content)?)
}

fn locked_packages(lock: &Value) -> Result<Vec<LockedPackage>> {
    let version = lock
        .get("lockfileVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);

    let mut locked = BTreeMap::new();
    if version >= 2 {
        let packages = lock
            .get("packages")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid_lockfile("the \"packages\" object is missing"))?;
        for (key, entry) in packages {
            if key.is_empty() || entry.get("link").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            // Workspace members live in the source tree
            let Some(derived) = name_from_key(key) else {
                continue;
            };
            let name = str_field(entry, "name").unwrap_or_else(|| derived.to_string());
            let Some(version) = str_field(entry, "version") else {
                return Err(invalid_lockfile(&format!("\"{}\" has no version", key)));
            };
            let package = LockedPackage {
                name,
                version,
                resolved: str_field(entry, "resolved"),
                integrity: str_field(entry, "integrity"),
                dev: entry.get("dev").and_then(Value::as_bool).unwrap_or(false),
            };
            locked.insert((package.name.clone(), package.version.clone()), package);
        }
    } else if let Some(dependencies) = lock.get("dependencies").and_then(Value::as_object) {
        collect_v1(dependencies, &mut locked)?;
    }
    Ok(locked.into_values().collect())
}

fn collect_v1(
    dependencies: &serde_json::Map<String, Value>,
    locked: &mut BTreeMap<(String, String), LockedPackage>,
) -> Result<()> {
    for (name, entry) in dependencies {
        let Some(version) = str_field(entry, "version") else {
            return Err(invalid_lockfile(&format!("\"{}\" has no version", name)));
        };
        let package = LockedPackage {
            name: name.clone(),
            version,
            resolved: str_field(entry, "resolved"),
            integrity: str_field(entry, "integrity"),
            dev: entry.get("dev").and_then(Value::as_bool).unwrap_or(false),
        };
        locked
            .entry((package.name.clone(), package.version.clone()))
            .or_insert(package);
        if let Some(nested) = entry.get("dependencies").and_then(Value::as_object) {
            collect_v1(nested, locked)?;
        }
    }
    Ok(())
}

pub struct NpmResolver {
    fetcher: Arc<dyn ArtifactFetcher>,
    token: Option<String>,
}

impl NpmResolver {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, token: Option<String>) -> Self {
        Self { fetcher, token }
    }

    async fn stage(&self, package: &LockedPackage, options: &ResolveOptions) -> Result<String> {
        let relative = package.staged_path()?;
        let target = staging_target(&options.staging_dir, Path::new(&relative))?;
        let url = package.resolved.as_deref().unwrap_or_default();
        let data = options
            .cancel
            .guard(
                &format!("downloading {}", url),
                options.timeout,
                self.fetcher.fetch_bytes(url, self.token.as_deref()),
            )
            .await?;

        match package.integrity.as_deref().map(|sri| verify_sri(sri, &data)) {
            Some(SriCheck::Verified) => {}
            Some(SriCheck::Mismatch) => {
                return Err(VendorError::Integrity(format!(
                    "The integrity of the npm package {}@{} does not match package-lock.json",
                    package.name, package.version
                )))
            }
            Some(SriCheck::Unsupported) => warn!(
                package = %package.name,
                version = %package.version,
                "Only unsupported integrity algorithms listed, skipping verification"
            ),
            None => warn!(
                package = %package.name,
                version = %package.version,
                "No integrity recorded in package-lock.json"
            ),
        }

        write_staged(&target, &data).await?;
        Ok(relative)
    }

    /// Rewrites the working tree's lockfile to install from the bundled tarballs
    async fn point_lockfile_at_bundle(
        &self,
        root: &Path,
        mut lock: Value,
        bundled: &BTreeMap<String, String>,
    ) -> Result<()> {
        let rewritten = rewrite_resolved(&mut lock, bundled);
        if rewritten == 0 {
            return Ok(());
        }
        let path = root.join("package-lock.json");
        let mut content = serde_json::to_string_pretty(&lock)
            .map_err(|e| VendorError::Internal(format!("Failed to serialize package-lock.json: {}", e)))?;
        content.push('\n');
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| VendorError::io(path.display(), e))?;
        debug!(rewritten, "Pointed package-lock.json at the bundled tarballs");
        Ok(())
    }
}

#[async_trait]
impl Resolver for NpmResolver {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    async fn resolve(
        &self,
        tree: &WorkingTree,
        options: &ResolveOptions,
    ) -> Result<ResolutionResult> {
        let manifest: Value = serde_json::from_str(&read_manifest(&tree.root, "package.json")?)
            .map_err(|e| {
                VendorError::InvalidRepoStructure(format!("The package.json file is invalid: {}", e))
            })?;
        let (Some(name), Some(version)) = (str_field(&manifest, "name"), str_field(&manifest, "version"))
        else {
            return Err(VendorError::InvalidRepoStructure(
                "The package.json file must define \"name\" and \"version\"".to_string(),
            ));
        };
        let lock = read_lockfile(&read_manifest(&tree.root, "package-lock.json")?)?;
        let locked = locked_packages(&lock)?;

        let skip_dev = options.has_flag(SKIP_DEV_DEPENDENCIES);
        info!(package = %name, locked = locked.len(), skip_dev, "Resolving npm packages");

        let mut dependencies = BTreeSet::new();
        let mut staged = Vec::new();
        let mut bundled = BTreeMap::new();
        for package in locked.iter().filter(|p| !(skip_dev && p.dev)) {
            let mut resolved = Package::new(&package.name, Ecosystem::Npm, &package.version);
            if let Some(integrity) = &package.integrity {
                resolved = resolved.with_integrity(integrity);
            }

            if package.is_registry() {
                let path = self.stage(package, options).await?;
                if let Some(url) = &package.resolved {
                    bundled.insert(url.clone(), format!("file:{}/{}", BUNDLED_FROM_APP, path));
                }
                staged.push(StagedSource {
                    package: resolved.clone(),
                    path: PathBuf::from(path),
                });
            } else {
                debug!(package = %package.name, resolved = ?package.resolved, "Recording non-registry package");
            }
            dependencies.insert(Dependency::new(resolved));
        }

        self.point_lockfile_at_bundle(&tree.root, lock, &bundled).await?;

        let mut environment_variables = BTreeMap::new();
        environment_variables.insert("npm_config_offline".to_string(), "true".to_string());

        Ok(ResolutionResult {
            packages: [Package::new(name, Ecosystem::Npm, version)].into_iter().collect(),
            dependencies,
            environment_variables,
            path_variables: BTreeSet::new(),
            staged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolvers::testing;
    use crate::tools::MockFetcher;
    use serde_json::json;
    use tempfile::TempDir;
    use yare::parameterized;

    const LOCK_V3: &str = r#"{
      "name": "web",
      "version": "1.0.0",
      "lockfileVersion": 3,
      "packages": {
        "": { "name": "web", "version": "1.0.0" },
        "node_modules/left-pad": {
          "version": "1.3.0",
          "resolved": "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz",
          "integrity": "sha512-abc"
        },
        "node_modules/@babel/core": {
          "version": "7.23.0",
          "resolved": "https://registry.npmjs.org/@babel/core/-/core-7.23.0.tgz",
          "dev": true
        },
        "node_modules/a/node_modules/left-pad": {
          "version": "1.3.0",
          "resolved": "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"
        },
        "node_modules/shared": { "resolved": "packages/shared", "link": true },
        "packages/shared": { "name": "shared", "version": "0.1.0" }
      }
    }"#;

    #[test]
    fn test_parse_v3_lockfile() {
        let locked = parse_lockfile(LOCK_V3).unwrap();
        let names: Vec<&str> = locked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@babel/core", "left-pad"]);
        assert!(locked[0].dev);
        assert_eq!(locked[1].integrity.as_deref(), Some("sha512-abc"));
    }

    #[test]
    fn test_parse_v1_lockfile_with_nesting() {
        let lock = r#"{
          "lockfileVersion": 1,
          "dependencies": {
            "a": {
              "version": "1.0.0",
              "resolved": "https://registry.npmjs.org/a/-/a-1.0.0.tgz",
              "dependencies": {
                "b": { "version": "2.0.0", "resolved": "https://registry.npmjs.org/b/-/b-2.0.0.tgz" }
              }
            },
            "c": { "version": "github:org/c#abcdef" }
          }
        }"#;
        let locked = parse_lockfile(lock).unwrap();
        assert_eq!(locked.len(), 3);
        let c = locked.iter().find(|p| p.name == "c").unwrap();
        assert!(!c.is_registry());
    }

    #[test]
    fn test_parse_lockfile_rejects_garbage() {
        assert!(matches!(
            parse_lockfile("not json"),
            Err(VendorError::InvalidRepoStructure(_))
        ));
        assert!(parse_lockfile(r#"{"lockfileVersion": 2}"#).is_err());
    }

    #[test]
    fn test_staged_path_keeps_scope() {
        let scoped = LockedPackage {
            name: "@babel/core".into(),
            version: "7.23.0".into(),
            resolved: None,
            integrity: None,
            dev: false,
        };
        assert_eq!(scoped.staged_path().unwrap(), "@babel/core/-/core-7.23.0.tgz");
    }

    #[parameterized(
        parent = { "../../../escaped", "1" },
        scoped_parent = { "@scope/..", "1" },
        scope_parent = { "@../x", "1" },
        nested = { "a/b", "1" },
        absolute = { "/etc", "1" },
        version_slash = { "x", "1/../../y" },
    )]
    fn test_staged_path_rejects_unsafe_names(name: &str, version: &str) {
        let package = LockedPackage {
            name: name.into(),
            version: version.into(),
            resolved: Some("https://r/x.tgz".into()),
            integrity: None,
            dev: false,
        };
        assert!(matches!(
            package.staged_path(),
            Err(VendorError::InvalidRepoStructure(_))
        ));
    }

    fn sri(data: &[u8]) -> String {
        use base64::Engine;
        use sha2::{Digest, Sha512};
        format!(
            "sha512-{}",
            base64::engine::general_purpose::STANDARD.encode(Sha512::digest(data))
        )
    }

    struct Project {
        dir: TempDir,
        fetcher: Arc<MockFetcher>,
    }

    impl Project {
        fn new(lock: serde_json::Value) -> Self {
            let dir = TempDir::new().unwrap();
            let app = dir.path().join("app");
            std::fs::create_dir_all(&app).unwrap();
            std::fs::write(app.join("package.json"), r#"{"name": "web", "version": "1.0.0"}"#).unwrap();
            std::fs::write(app.join("package-lock.json"), lock.to_string()).unwrap();
            Self {
                dir,
                fetcher: Arc::new(MockFetcher::new()),
            }
        }

        fn app(&self) -> PathBuf {
            self.dir.path().join("app")
        }

        fn staging(&self) -> PathBuf {
            self.dir.path().join("deps/npm")
        }

        async fn resolve(&self, flags: &[&str]) -> Result<ResolutionResult> {
            NpmResolver::new(self.fetcher.clone(), Some("s3cret".into()))
                .resolve(&testing::tree(&self.app()), &testing::options(&self.staging(), flags))
                .await
        }
    }

    const LEFT_PAD_URL: &str = "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz";
    const JEST_URL: &str = "https://registry.npmjs.org/jest/-/jest-29.0.0.tgz";

    fn lock_with(entries: serde_json::Value) -> serde_json::Value {
        let mut packages = json!({"": {"name": "web", "version": "1.0.0"}});
        for (key, entry) in entries.as_object().unwrap() {
            packages[key] = entry.clone();
        }
        json!({"name": "web", "version": "1.0.0", "lockfileVersion": 3, "packages": packages})
    }

    #[tokio::test]
    async fn test_resolve_stages_tarballs_and_rewrites_lockfile() {
        let project = Project::new(lock_with(json!({
            "node_modules/left-pad": {"version": "1.3.0", "resolved": LEFT_PAD_URL, "integrity": sri(b"pad")},
            "node_modules/jest": {"version": "29.0.0", "resolved": JEST_URL, "dev": true},
            "node_modules/local": {"version": "0.1.0", "resolved": "git+ssh://git@github.com/org/local.git#abc"}
        })));
        project.fetcher.add_file(LEFT_PAD_URL, b"pad".to_vec());
        project.fetcher.add_file(JEST_URL, b"jest".to_vec());

        let result = project.resolve(&[]).await.unwrap();

        assert_eq!(result.packages.iter().next().unwrap().name, "web");
        assert_eq!(result.dependencies.len(), 3);
        assert_eq!(result.staged.len(), 2);
        assert_eq!(
            std::fs::read(project.staging().join("left-pad/-/left-pad-1.3.0.tgz")).unwrap(),
            b"pad"
        );
        assert!(project
            .fetcher
            .requests()
            .iter()
            .all(|(_, token)| token.as_deref() == Some("s3cret")));

        let lock: Value =
            serde_json::from_str(&std::fs::read_to_string(project.app().join("package-lock.json")).unwrap())
                .unwrap();
        assert_eq!(
            lock["packages"]["node_modules/left-pad"]["resolved"],
            "file:../deps/npm/left-pad/-/left-pad-1.3.0.tgz"
        );
        assert_eq!(
            lock["packages"]["node_modules/local"]["resolved"],
            "git+ssh://git@github.com/org/local.git#abc"
        );
        // The rewritten path reaches the staged file from the app directory
        let relative = lock["packages"]["node_modules/left-pad"]["resolved"]
            .as_str()
            .unwrap()
            .trim_start_matches("file:");
        assert!(project.app().join(relative).is_file());

        assert_eq!(result.environment_variables["npm_config_offline"], "true");
        assert!(!result.environment_variables.contains_key("npm_config_cache"));
    }

    #[tokio::test]
    async fn test_resolve_skips_dev_dependencies_when_asked() {
        let project = Project::new(lock_with(json!({
            "node_modules/left-pad": {"version": "1.3.0", "resolved": LEFT_PAD_URL},
            "node_modules/jest": {"version": "29.0.0", "resolved": JEST_URL, "dev": true}
        })));
        project.fetcher.add_file(LEFT_PAD_URL, b"pad".to_vec());

        let result = project.resolve(&[SKIP_DEV_DEPENDENCIES]).await.unwrap();
        let names: Vec<&str> = result.dependencies.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["left-pad"]);
        assert!(!project.staging().join("jest").exists());
        assert_eq!(project.fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_integrity_mismatch_fails() {
        let project = Project::new(lock_with(json!({
            "node_modules/left-pad": {"version": "1.3.0", "resolved": LEFT_PAD_URL, "integrity": sri(b"pad")}
        })));
        project.fetcher.add_file(LEFT_PAD_URL, b"tampered".to_vec());

        let err = project.resolve(&[]).await.unwrap_err();
        assert!(matches!(err, VendorError::Integrity(_)));
        assert!(err.to_string().contains("left-pad@1.3.0"));
        assert!(!project.staging().join("left-pad").exists());
    }

    #[tokio::test]
    async fn test_resolve_refuses_names_escaping_the_staging_directory() {
        let project = Project::new(lock_with(json!({
            "node_modules/x": {"name": "../../../escaped", "version": "1", "resolved": "https://r/x.tgz"}
        })));
        project.fetcher.add_file("https://r/x.tgz", b"payload".to_vec());

        let err = project.resolve(&[]).await.unwrap_err();
        assert!(matches!(err, VendorError::InvalidRepoStructure(_)));
        assert!(!project.dir.path().join("escaped").exists());
        assert!(project.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_v1_lockfile_checks_sha1() {
        use base64::Engine;
        use sha1::{Digest, Sha1};
        let integrity = format!(
            "sha1-{}",
            base64::engine::general_purpose::STANDARD.encode(Sha1::digest(b"pad"))
        );
        let project = Project::new(json!({
            "lockfileVersion": 1,
            "dependencies": {
                "left-pad": {"version": "1.3.0", "resolved": LEFT_PAD_URL, "integrity": integrity}
            }
        }));
        project.fetcher.add_file(LEFT_PAD_URL, b"other".to_vec());
        assert!(matches!(
            project.resolve(&[]).await,
            Err(VendorError::Integrity(_))
        ));
    }
}
