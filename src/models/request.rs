//! The request resource and its serialized views

use super::{Dependency, Ecosystem, Package, Replacement};
use crate::state::{RequestState, StateHistory, StateTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Reference to the published archive of a completed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Validated input of a new request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub repo: String,
    pub git_ref: String,
    pub pkg_managers: BTreeSet<Ecosystem>,
    pub flags: BTreeSet<String>,
    pub dependency_replacements: Vec<Replacement>,
    pub submitted_by: Option<String>,
    pub user: Option<String>,
}

/// Stored request record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u64,
    pub repo: String,
    pub git_ref: String,
    pub pkg_managers: BTreeSet<Ecosystem>,
    pub flags: BTreeSet<String>,
    pub dependency_replacements: Vec<Replacement>,
    pub environment_variables: BTreeMap<String, String>,
    /// Names of environment variables holding bundle-relative paths
    pub path_variables: BTreeSet<String>,
    pub packages: BTreeSet<Package>,
    pub dependencies: BTreeSet<Dependency>,
    pub submitted_by: Option<String>,
    pub user: Option<String>,
    pub state_history: StateHistory,
    pub bundle: Option<BundleRef>,
    pub created: DateTime<Utc>,
}

impl Request {
    pub fn from_new(id: u64, new: NewRequest, created: DateTime<Utc>) -> Self {
        let state_history =
            StateHistory::started("The request was initiated", new.submitted_by.clone(), created);
        Self {
            id,
            repo: new.repo,
            git_ref: new.git_ref,
            pkg_managers: new.pkg_managers,
            flags: new.flags,
            dependency_replacements: new.dependency_replacements,
            environment_variables: BTreeMap::new(),
            path_variables: BTreeSet::new(),
            packages: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            submitted_by: new.submitted_by,
            user: new.user,
            state_history,
            bundle: None,
            created,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state_history.current_state()
    }

    pub fn state_reason(&self) -> &str {
        self.state_history.current_reason()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.state_history
            .last()
            .map(|entry| entry.updated)
            .unwrap_or(self.created)
    }

    /// Inputs that decide the resolution outcome
    pub fn to_new_request(&self) -> NewRequest {
        NewRequest {
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            pkg_managers: self.pkg_managers.clone(),
            flags: self.flags.clone(),
            dependency_replacements: self.dependency_replacements.clone(),
            submitted_by: self.submitted_by.clone(),
            user: self.user.clone(),
        }
    }

    pub fn summary(&self) -> RequestView {
        RequestView {
            id: self.id,
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            pkg_managers: self.pkg_managers.iter().copied().collect(),
            state: self.state(),
            state_reason: self.state_reason().to_string(),
            user: self.user.clone(),
            dependencies: self.dependencies.len(),
            packages: self.packages.len(),
            environment_variables: self.environment_variables.clone(),
            flags: self.flags.iter().cloned().collect(),
            created: self.created,
            updated: self.last_updated(),
        }
    }

    pub fn detail(&self) -> RequestDetail {
        RequestDetail {
            id: self.id,
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            pkg_managers: self.pkg_managers.iter().copied().collect(),
            state: self.state(),
            state_reason: self.state_reason().to_string(),
            state_history: self.state_history.entries().to_vec(),
            user: self.user.clone(),
            submitted_by: self.submitted_by.clone(),
            dependencies: self.dependencies.iter().cloned().collect(),
            packages: self.packages.iter().cloned().collect(),
            dependency_replacements: self.dependency_replacements.clone(),
            environment_variables: self.environment_variables.clone(),
            path_variables: self.path_variables.clone(),
            flags: self.flags.iter().cloned().collect(),
            bundle_sha256: self.bundle.as_ref().map(|bundle| bundle.sha256.clone()),
            created: self.created,
            updated: self.last_updated(),
        }
    }
}

/// The build environment for a bundle extracted to `bundle_root`
///
/// Path variables are joined onto `bundle_root`; tools such as Go refuse relative
/// cache locations.
pub fn environment_at(
    environment_variables: &BTreeMap<String, String>,
    path_variables: &BTreeSet<String>,
    bundle_root: &Path,
) -> BTreeMap<String, String> {
    environment_variables
        .iter()
        .map(|(name, value)| {
            let value = if path_variables.contains(name) {
                bundle_root.join(value).display().to_string()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

impl RequestDetail {
    pub fn environment_at(&self, bundle_root: &Path) -> BTreeMap<String, String> {
        environment_at(&self.environment_variables, &self.path_variables, bundle_root)
    }
}

/// Summary view used by list endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestView {
    pub id: u64,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pkg_managers: Vec<Ecosystem>,
    pub state: RequestState,
    pub state_reason: String,
    pub user: Option<String>,
    pub dependencies: usize,
    pub packages: usize,
    pub environment_variables: BTreeMap<String, String>,
    pub flags: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Full view of a single request; `state_history` is oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetail {
    pub id: u64,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pkg_managers: Vec<Ecosystem>,
    pub state: RequestState,
    pub state_reason: String,
    pub state_history: Vec<StateTransition>,
    pub user: Option<String>,
    pub submitted_by: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub packages: Vec<Package>,
    pub dependency_replacements: Vec<Replacement>,
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub path_variables: BTreeSet<String>,
    pub flags: Vec<String>,
    pub bundle_sha256: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}
