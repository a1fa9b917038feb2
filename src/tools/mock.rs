use super::command::{CommandOutput, CommandRunner, CommandSpec};
use super::download::ArtifactFetcher;
use crate::error::{Result, ToolError, VendorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub type CommandHandler =
    Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync>;

struct Rule {
    program: String,
    subcommand: Option<String>,
    handler: CommandHandler,
}

/// Scripted [`CommandRunner`]; unmatched commands succeed with empty output
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    delay: Option<Duration>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Every command takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn on(
        &self,
        program: impl Into<String>,
        subcommand: Option<&str>,
        handler: impl Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync + 'static,
    ) {
        self.rules.lock().unwrap().push(Rule {
            program: program.into(),
            subcommand: subcommand.map(str::to_string),
            handler: Box::new(handler),
        });
    }

    /// `git checkout` materializes `files` in the checkout directory
    pub fn serving_git_tree(files: &[(&str, &str)]) -> Self {
        let runner = Self::new();
        let files: Vec<(String, String)> = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        runner.on("git", Some("checkout"), move |spec| {
            let Some(cwd) = &spec.cwd else {
                return Err(failure(spec, "no working directory"));
            };
            write_files(cwd, &files).map_err(|e| failure(spec, &e.to_string()))?;
            Ok(CommandOutput::default())
        });
        runner
    }

    /// `program subcommand` always fails with `stderr`
    pub fn failing(&self, program: &str, subcommand: &str, stderr: &'static str) {
        self.on(program, Some(subcommand), move |spec| Err(failure(spec, stderr)));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, program: &str, subcommand: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program == program && c.args.first().map(String::as_str) == Some(subcommand))
            .count()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn failure(spec: &CommandSpec, stderr: &str) -> ToolError {
    ToolError::Failed {
        program: spec.program.clone(),
        status: 1,
        stderr: stderr.to_string(),
    }
}

pub fn write_files(root: &Path, files: &[(String, String)]) -> std::io::Result<()> {
    for (path, content) in files {
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        self.calls.lock().unwrap().push(spec.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let rules = self.rules.lock().unwrap();
        let rule = rules.iter().find(|rule| {
            rule.program == spec.program
                && rule
                    .subcommand
                    .as_deref()
                    .map_or(true, |sub| spec.args.first().map(String::as_str) == Some(sub))
        });
        match rule {
            Some(rule) => (rule.handler)(spec),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// In-memory registry for [`ArtifactFetcher`] consumers
pub struct MockFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    documents: Mutex<HashMap<String, serde_json::Value>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn add_file(&self, url: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(url.into(), data.into());
    }

    pub fn add_json(&self, url: impl Into<String>, document: serde_json::Value) {
        self.documents.lock().unwrap().insert(url.into(), document);
    }

    /// URLs requested so far, with the bearer token that was sent
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(url: &str) -> VendorError {
    VendorError::InvalidRepoStructure(format!("The artifact at {} does not exist", url))
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), bearer.map(str::to_string)));
        self.files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| missing(url))
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        self.requests.lock().unwrap().push((url.to_string(), None));
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| missing(url))
    }
}
