//! Command handlers; each returns the process exit code

use super::commands::{ConfigArgs, VendorArgs};
use super::output::OutputFormatter;
use crate::api::{Caller, NewRequestBody, Privilege, ReplacementBody, RequestService};
use crate::cache::SourceCache;
use crate::config::VendorboxConfig;
use crate::error::VendorError;
use crate::models::Replacement;
use crate::pipeline::{PipelineContext, PipelineOrchestrator};
use crate::progress::{LoggingHandler, NoOpHandler, ProgressHandler};
use crate::resolvers::ResolverToolkit;
use crate::scm::SourceFetcher;
use crate::state::RequestState;
use crate::store::{InMemoryRequestStore, RequestStore};
use crate::tools::{HttpFetcher, ProcessRunner};
use crate::worker::WorkerPool;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_INVALID: i32 = 2;

/// Turns the command line into the body a service client would submit
pub fn request_body(args: &VendorArgs) -> Result<NewRequestBody, String> {
    let dependency_replacements = args
        .replacements
        .iter()
        .map(|directive| {
            Replacement::parse_directive(directive)
                .map(|r| ReplacementBody {
                    name: r.name,
                    ecosystem: r.ecosystem.tag().to_string(),
                    version: r.version,
                    new_name: r.new_name,
                })
                .ok_or_else(|| {
                    format!(
                        "Invalid replacement '{}', expected NAME:TYPE:VERSION=NEW_NAME",
                        directive
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NewRequestBody {
        repo: Some(args.repo.clone()),
        git_ref: Some(args.git_ref.clone()),
        pkg_managers: (!args.pkg_managers.is_empty()).then(|| args.pkg_managers.clone()),
        dependency_replacements,
        flags: args.flags.clone(),
        user: None,
    })
}

fn local_caller() -> Caller {
    let identity = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    Caller::user(identity).with_privilege(Privilege::Administer)
}

pub async fn handle_vendor(args: &VendorArgs, quiet: bool) -> i32 {
    let config = VendorboxConfig::default();
    if let Err(e) = config.validate() {
        error!("{}", e);
        eprintln!("Error: {}", e);
        return EXIT_INVALID;
    }

    let body = match request_body(args) {
        Ok(body) => body,
        Err(message) => {
            eprintln!("Error: {}", message);
            return EXIT_INVALID;
        }
    };

    match run_vendor(args, body, Arc::new(config), quiet).await {
        Ok(code) => code,
        Err(e) => {
            error!("Vendoring failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<VendorError>() {
                Some(err) if err.status_code() < 500 => EXIT_INVALID,
                _ => EXIT_FAILED,
            }
        }
    }
}

async fn run_vendor(
    args: &VendorArgs,
    body: NewRequestBody,
    config: Arc<VendorboxConfig>,
    quiet: bool,
) -> Result<i32> {
    let store = Arc::new(InMemoryRequestStore::new());
    let runner = Arc::new(ProcessRunner);
    let fetcher = Arc::new(HttpFetcher::new(config.step_timeout())?);
    let progress: Arc<dyn ProgressHandler> = if quiet {
        Arc::new(NoOpHandler)
    } else {
        Arc::new(LoggingHandler)
    };

    let context = PipelineContext::new(
        store.clone(),
        SourceFetcher::new(SourceCache::new(&config.sources_dir), runner.clone(), &config),
        ResolverToolkit {
            runner,
            fetcher,
            config: config.clone(),
        },
        config.clone(),
    )
    .with_progress(progress);

    let (queue, pool) = WorkerPool::start(Arc::new(PipelineOrchestrator::new(context)), 1);
    let service = RequestService::new(store.clone(), queue, config.clone());

    let created = service.create(&local_caller(), body).await;
    // Drain the queue even when submission failed so no worker is left behind
    pool.shutdown().await;
    let created = created?;
    debug!(request_id = created.id, "Request processed");

    let detail = service.get(created.id).await?;
    let mut written = None;
    if detail.state == RequestState::Complete {
        let stored = store
            .get(created.id)
            .await?
            .and_then(|request| request.bundle)
            .map(|bundle| bundle.path);
        written = match &args.output {
            Some(path) => {
                let download = service.download(created.id).await?;
                write_bundle(path, &download.data).await?;
                info!(path = %path.display(), "Bundle written");
                Some(path.clone())
            }
            None => stored,
        };
    }

    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_request(&detail, written.as_deref())?);

    Ok(if detail.state == RequestState::Complete {
        EXIT_SUCCESS
    } else {
        EXIT_FAILED
    })
}

async fn write_bundle(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub async fn handle_config(args: &ConfigArgs) -> i32 {
    let config = VendorboxConfig::default();
    let formatter = OutputFormatter::new(args.format.into());
    match formatter.format_config(&config) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return EXIT_FAILED;
        }
    }

    if let Err(e) = config.validate() {
        eprintln!("Warning: {}", e);
        return EXIT_INVALID;
    }
    EXIT_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::OutputFormatArg;
    use serial_test::serial;

    fn args(replacements: &[&str], pkg_managers: &[&str]) -> VendorArgs {
        VendorArgs {
            repo: "https://github.com/org/app".into(),
            git_ref: "b".repeat(40),
            pkg_managers: pkg_managers.iter().map(|s| s.to_string()).collect(),
            replacements: replacements.iter().map(|s| s.to_string()).collect(),
            flags: vec![],
            output: None,
            format: OutputFormatArg::Human,
        }
    }

    #[test]
    fn test_request_body_from_arguments() {
        let body = request_body(&args(&["rsc.io/quote:gomod:v1.5.2=example.com/quote"], &["gomod"]))
            .unwrap();
        assert_eq!(body.repo.as_deref(), Some("https://github.com/org/app"));
        assert_eq!(body.pkg_managers, Some(vec!["gomod".to_string()]));
        assert_eq!(
            body.dependency_replacements,
            vec![ReplacementBody {
                name: "rsc.io/quote".into(),
                ecosystem: "gomod".into(),
                version: "v1.5.2".into(),
                new_name: "example.com/quote".into(),
            }]
        );
    }

    #[test]
    fn test_no_pkg_managers_uses_service_default() {
        let body = request_body(&args(&[], &[])).unwrap();
        assert!(body.pkg_managers.is_none());
    }

    #[test]
    fn test_malformed_replacement_is_rejected() {
        let err = request_body(&args(&["left-pad=pad-left"], &[])).unwrap_err();
        assert!(err.contains("NAME:TYPE:VERSION=NEW_NAME"));
    }

    #[tokio::test]
    #[serial]
    async fn test_invalid_request_exits_with_invalid_code() {
        let mut bad = args(&[], &["npm"]);
        bad.git_ref = "main".into();
        assert_eq!(handle_vendor(&bad, true).await, EXIT_INVALID);
    }
}
