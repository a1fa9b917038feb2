//! Output formatting for multiple formats
//!
//! Requests and the effective configuration can be rendered as JSON, YAML or
//! human-readable text.
//!
//! # Example
//!
//! ```ignore
//! use vendorbox::cli::output::{OutputFormat, OutputFormatter};
//!
//! let formatter = OutputFormatter::new(OutputFormat::Json);
//! println!("{}", formatter.format_request(&request.detail())?);
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::VendorboxConfig;
use crate::models::RequestDetail;
use crate::state::RequestState;

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a request, noting where its bundle was written when there is one
    pub fn format_request(&self, request: &RequestDetail, bundle: Option<&Path>) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(request)
                .context("Failed to serialize request to JSON"),
            OutputFormat::Yaml => {
                serde_yaml::to_string(request).context("Failed to serialize request to YAML")
            }
            OutputFormat::Human => Ok(self.format_request_human(request, bundle)),
        }
    }

    pub fn format_config(&self, config: &VendorboxConfig) -> Result<String> {
        // Sorted so the output is stable
        let config_map: BTreeMap<String, String> = config.to_display_map().into_iter().collect();
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&config_map)
                .context("Failed to serialize config to JSON"),
            OutputFormat::Yaml => {
                serde_yaml::to_string(&config_map).context("Failed to serialize config to YAML")
            }
            OutputFormat::Human => Ok(self.format_config_human(&config_map)),
        }
    }

    fn format_request_human(&self, request: &RequestDetail, bundle: Option<&Path>) -> String {
        let mut output = String::new();

        let mark = match request.state {
            RequestState::Complete => "\u{2713}",
            RequestState::InProgress => "\u{2026}",
            _ => "\u{2717}",
        };
        output.push_str(&format!("{} Request {}\n", mark, request.id));
        output.push_str(RULE);
        output.push_str("\n\n");

        output.push_str(&format!("Repository:  {}\n", request.repo));
        output.push_str(&format!("Revision:    {}\n", request.git_ref));
        output.push_str(&format!("State:       {}\n", request.state));
        output.push_str(&format!("Reason:      {}\n\n", request.state_reason));

        output.push_str("Packages:\n");
        push_tree(
            &mut output,
            request.packages.iter().map(|p| p.to_string()).collect(),
        );

        output.push_str("Dependencies:\n");
        push_tree(
            &mut output,
            request
                .dependencies
                .iter()
                .map(|d| match &d.replaces {
                    Some(original) => format!("{} (replaces {})", d.package, original),
                    None => d.package.to_string(),
                })
                .collect(),
        );

        if !request.environment_variables.is_empty() {
            output.push_str("Environment:\n");
            push_tree(
                &mut output,
                request
                    .environment_variables
                    .iter()
                    .map(|(k, v)| {
                        if request.path_variables.contains(k) {
                            format!("{}={} (relative to the bundle root)", k, v)
                        } else {
                            format!("{}={}", k, v)
                        }
                    })
                    .collect(),
            );
        }

        if let Some(sha) = &request.bundle_sha256 {
            output.push_str(&format!("Bundle sha256: {}\n", sha));
        }
        if let Some(path) = bundle {
            output.push_str(&format!("Bundle written to {}\n", path.display()));
        }

        output
    }

    fn format_config_human(&self, config_map: &BTreeMap<String, String>) -> String {
        let mut output = String::new();

        output.push_str("vendorbox Configuration\n");
        output.push_str(RULE);
        output.push_str("\n\n");

        output.push_str("Storage:\n");
        for (label, key) in [
            ("Sources", "sources_dir"),
            ("Bundles", "bundles_dir"),
            ("Work", "work_dir"),
        ] {
            if let Some(value) = config_map.get(key) {
                output.push_str(&format!("  {}: {}\n", label, value));
            }
        }

        output.push_str("\nProcessing:\n");
        for (label, key, unit) in [
            ("Workers", "workers", ""),
            ("Fetch Retries", "fetch_retries", ""),
            ("Step Timeout", "step_timeout_secs", "s"),
            ("Stale After", "stale_after_secs", "s"),
            ("Default Package Managers", "default_pkg_managers", ""),
        ] {
            if let Some(value) = config_map.get(key) {
                output.push_str(&format!("  {}: {}{}\n", label, value, unit));
            }
        }

        output.push_str("\nPackage Managers:\n");
        for (label, key) in [
            ("GOPROXY", "goproxy"),
            ("Pip Index", "pip_index_url"),
            ("npm Token", "npm_token"),
        ] {
            if let Some(value) = config_map.get(key) {
                output.push_str(&format!("  {}: {}\n", label, value));
            }
        }

        if let Some(level) = config_map.get("log_level") {
            output.push_str(&format!("\nLog Level: {}\n", level));
        }

        output
    }
}

fn push_tree(output: &mut String, items: Vec<String>) {
    if items.is_empty() {
        output.push_str("\u{2514}\u{2500} (none)\n\n");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let connector = if i == items.len() - 1 { "\u{2514}" } else { "\u{251C}" };
        output.push_str(&format!("{}\u{2500} {}\n", connector, item));
    }
    output.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dependency, Ecosystem, NewRequest, Package, Request};
    use chrono::Utc;

    fn detail() -> RequestDetail {
        let mut request = Request::from_new(
            7,
            NewRequest {
                repo: "https://github.com/org/app".into(),
                git_ref: "a".repeat(40),
                pkg_managers: [Ecosystem::Npm].into_iter().collect(),
                flags: Default::default(),
                dependency_replacements: vec![],
                submitted_by: None,
                user: None,
            },
            Utc::now(),
        );
        request
            .packages
            .insert(Package::new("app", Ecosystem::Npm, "1.0.0"));
        request.dependencies.insert(Dependency {
            package: Package::new("pad-left", Ecosystem::Npm, "2.0.0"),
            replaces: Some(Package::new("left-pad", Ecosystem::Npm, "1.3.0")),
        });
        request
            .environment_variables
            .insert("npm_config_offline".to_string(), "true".to_string());
        request
            .environment_variables
            .insert("PIP_FIND_LINKS".to_string(), "deps/pip".to_string());
        request.path_variables.insert("PIP_FIND_LINKS".to_string());
        request.detail()
    }

    #[test]
    fn test_json_format() {
        let output = OutputFormatter::new(OutputFormat::Json)
            .format_request(&detail(), None)
            .unwrap();
        let parsed: RequestDetail = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.id, 7);
        assert!(output.contains("\"ref\""));
    }

    #[test]
    fn test_yaml_format() {
        let output = OutputFormatter::new(OutputFormat::Yaml)
            .format_request(&detail(), None)
            .unwrap();
        let parsed: RequestDetail = serde_yaml::from_str(&output).unwrap();
        assert_eq!(parsed.dependencies.len(), 1);
    }

    #[test]
    fn test_human_format() {
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_request(&detail(), Some(Path::new("/tmp/out.tar.gz")))
            .unwrap();
        assert!(output.contains("Request 7"));
        assert!(output.contains("in_progress"));
        assert!(output.contains("npm:app@1.0.0"));
        assert!(output.contains("npm:pad-left@2.0.0 (replaces npm:left-pad@1.3.0)"));
        assert!(output.contains("Bundle written to /tmp/out.tar.gz"));
        assert!(output.contains("PIP_FIND_LINKS=deps/pip (relative to the bundle root)"));
        assert!(output.contains("npm_config_offline=true\n"));
    }

    #[test]
    fn test_config_formats() {
        let config = VendorboxConfig::rooted_at("/srv/vendorbox");

        let json = OutputFormatter::new(OutputFormat::Json)
            .format_config(&config)
            .unwrap();
        let map: BTreeMap<String, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(map["bundles_dir"], "/srv/vendorbox/bundles");
        assert_eq!(map["npm_token"], "unset");

        let human = OutputFormatter::new(OutputFormat::Human)
            .format_config(&config)
            .unwrap();
        assert!(human.contains("Storage:"));
        assert!(human.contains("Sources: /srv/vendorbox/sources"));
    }
}
