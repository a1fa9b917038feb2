use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, Package};
use crate::pipeline::context::{PipelineContext, RequestContext};
use crate::pipeline::phase_trait::WorkflowPhase;
use crate::resolvers::ResolutionResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub struct MergePhase;

#[derive(Debug)]
pub struct Merged {
    pub packages: BTreeSet<Package>,
    pub dependencies: BTreeSet<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
    pub path_variables: BTreeSet<String>,
}

/// Unions the per-ecosystem outputs
///
/// Packages and dependencies are namespaced by their type so identical names from two
/// ecosystems never collide. An environment variable set to two different values is a
/// validation error.
pub fn merge(results: &BTreeMap<Ecosystem, ResolutionResult>) -> Result<Merged> {
    let mut merged = Merged {
        packages: BTreeSet::new(),
        dependencies: BTreeSet::new(),
        environment_variables: BTreeMap::new(),
        path_variables: BTreeSet::new(),
    };
    let mut origin: BTreeMap<&str, Ecosystem> = BTreeMap::new();

    for (ecosystem, result) in results {
        merged.packages.extend(result.packages.iter().cloned());
        merged.dependencies.extend(result.dependencies.iter().cloned());
        merged.path_variables.extend(result.path_variables.iter().cloned());

        for (name, value) in &result.environment_variables {
            match merged.environment_variables.get(name) {
                Some(existing) if existing != value => {
                    let first = origin.get(name.as_str()).copied().unwrap_or(*ecosystem);
                    return Err(VendorError::Validation(format!(
                        "The environment variable {} is set to \"{}\" by {} and to \"{}\" by {}",
                        name, existing, first, value, ecosystem
                    )));
                }
                Some(_) => {}
                None => {
                    merged
                        .environment_variables
                        .insert(name.clone(), value.clone());
                    origin.insert(name.as_str(), *ecosystem);
                }
            }
        }
    }
    Ok(merged)
}

#[async_trait]
impl WorkflowPhase for MergePhase {
    fn name(&self) -> &'static str {
        "merge"
    }

    async fn execute(&self, _pipeline: &PipelineContext, request: &mut RequestContext) -> Result<()> {
        let merged = merge(&request.results)?;
        debug!(
            request_id = request.request_id(),
            packages = merged.packages.len(),
            dependencies = merged.dependencies.len(),
            "Merged resolver outputs"
        );
        request.packages = merged.packages;
        request.dependencies = merged.dependencies;
        request.environment_variables = merged.environment_variables;
        request.path_variables = merged.path_variables;
        Ok(())
    }
}
