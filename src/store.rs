//! Persistence of request records
//!
//! [`RequestStore`] is the repository-style seam a durable backend implements. Every
//! state write is a compare-and-set against the state the writer last observed, and the
//! resolution outcome of a request can be written exactly once.

use crate::error::{Result, VendorError};
use crate::models::{BundleRef, Dependency, NewRequest, Package, Request};
use crate::state::RequestState;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Everything the pipeline persists when a request completes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub packages: BTreeSet<Package>,
    pub dependencies: BTreeSet<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
    pub path_variables: BTreeSet<String>,
    pub bundle: Option<BundleRef>,
}

/// Privileged changes applied through the administrative update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPatch {
    pub state: Option<(RequestState, String)>,
    pub packages: Option<BTreeSet<Package>>,
    pub dependencies: Option<BTreeSet<Dependency>>,
    pub environment_variables: Option<BTreeMap<String, String>>,
}

impl RequestPatch {
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.packages.is_none()
            && self.dependencies.is_none()
            && self.environment_variables.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub state: Option<RequestState>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert(&self, new: NewRequest) -> Result<Request>;

    async fn get(&self, id: u64) -> Result<Option<Request>>;

    /// Matching requests newest first, with the total match count
    async fn list(&self, filter: ListFilter, offset: usize, limit: usize)
        -> Result<(Vec<Request>, usize)>;

    /// Appends a transition if the request is still in `expected`
    async fn compare_and_set_state(
        &self,
        id: u64,
        expected: RequestState,
        next: RequestState,
        reason: &str,
        actor: Option<String>,
    ) -> Result<Request>;

    /// Records the outcome and moves `in_progress -> complete` in one step
    async fn finalize(&self, id: u64, resolution: Resolution, reason: &str) -> Result<Request>;

    async fn patch(&self, id: u64, patch: RequestPatch, actor: Option<String>) -> Result<Request>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    requests: BTreeMap<u64, Request>,
}

/// Process-local store used by the CLI and tests
#[derive(Default)]
pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
}

fn not_found(id: u64) -> VendorError {
    VendorError::NotFound(format!("The request {} does not exist", id))
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, new: NewRequest) -> Result<Request> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let request = Request::from_new(inner.next_id, new, Utc::now());
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: u64) -> Result<Option<Request>> {
        Ok(self.lock().requests.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: ListFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Request>, usize)> {
        let inner = self.lock();
        let matching: Vec<&Request> = inner
            .requests
            .values()
            .rev()
            .filter(|r| filter.state.map_or(true, |state| r.state() == state))
            .collect();
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn compare_and_set_state(
        &self,
        id: u64,
        expected: RequestState,
        next: RequestState,
        reason: &str,
        actor: Option<String>,
    ) -> Result<Request> {
        let mut inner = self.lock();
        let request = inner.requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        let current = request.state();
        if current != expected {
            return Err(VendorError::InvalidState(format!(
                "The request {} is \"{}\", expected \"{}\"",
                id, current, expected
            )));
        }
        request
            .state_history
            .transition(next, reason, actor, Utc::now())?;
        Ok(request.clone())
    }

    async fn finalize(&self, id: u64, resolution: Resolution, reason: &str) -> Result<Request> {
        let mut inner = self.lock();
        let request = inner.requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        if request.state() != RequestState::InProgress {
            return Err(VendorError::InvalidState(format!(
                "The request {} is \"{}\" and can no longer be completed",
                id,
                request.state()
            )));
        }
        if !request.packages.is_empty() || !request.dependencies.is_empty() || request.bundle.is_some()
        {
            return Err(VendorError::InvalidState(format!(
                "The resolution of request {} was already recorded",
                id
            )));
        }
        request
            .state_history
            .transition(RequestState::Complete, reason, None, Utc::now())?;
        request.packages = resolution.packages;
        request.dependencies = resolution.dependencies;
        request.environment_variables = resolution.environment_variables;
        request.path_variables = resolution.path_variables;
        request.bundle = resolution.bundle;
        Ok(request.clone())
    }

    async fn patch(&self, id: u64, patch: RequestPatch, actor: Option<String>) -> Result<Request> {
        let mut inner = self.lock();
        let request = inner.requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        if let Some(packages) = patch.packages {
            request.packages = packages;
        }
        if let Some(dependencies) = patch.dependencies {
            request.dependencies = dependencies;
        }
        if let Some(environment_variables) = patch.environment_variables {
            request.environment_variables = environment_variables;
        }
        if let Some((state, reason)) = patch.state {
            request.state_history.append(state, reason, actor, Utc::now());
        }
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ecosystem;

    fn new_request() -> NewRequest {
        NewRequest {
            repo: "https://github.com/org/app".into(),
            git_ref: "b".repeat(40),
            pkg_managers: [Ecosystem::Gomod].into_iter().collect(),
            flags: BTreeSet::new(),
            dependency_replacements: vec![],
            submitted_by: Some("builder".into()),
            user: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = InMemoryRequestStore::new();
        let first = store.insert(new_request()).await.unwrap();
        let second = store.insert(new_request()).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert!(store.get(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_expectation() {
        let store = InMemoryRequestStore::new();
        let request = store.insert(new_request()).await.unwrap();
        store
            .compare_and_set_state(request.id, RequestState::InProgress, RequestState::Failed, "boom", None)
            .await
            .unwrap();
        let err = store
            .compare_and_set_state(
                request.id,
                RequestState::InProgress,
                RequestState::Complete,
                "late",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VendorError::InvalidState(_)));
        let stored = store.get(request.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), RequestState::Failed);
        assert_eq!(stored.state_reason(), "boom");
    }

    #[tokio::test]
    async fn test_finalize_is_write_once() {
        let store = InMemoryRequestStore::new();
        let request = store.insert(new_request()).await.unwrap();
        let resolution = Resolution {
            dependencies: [Dependency::new(Package::new("rsc.io/quote", Ecosystem::Gomod, "v1.5.2"))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let done = store
            .finalize(request.id, resolution.clone(), "Completed successfully")
            .await
            .unwrap();
        assert_eq!(done.state(), RequestState::Complete);
        assert_eq!(done.dependencies.len(), 1);
        assert!(store.finalize(request.id, resolution, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_and_pages_newest_first() {
        let store = InMemoryRequestStore::new();
        for _ in 0..5 {
            store.insert(new_request()).await.unwrap();
        }
        store
            .compare_and_set_state(2, RequestState::InProgress, RequestState::Failed, "x", None)
            .await
            .unwrap();

        let (page, total) = store.list(ListFilter::default(), 0, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 4]);

        let failed = ListFilter {
            state: Some(RequestState::Failed),
        };
        let (page, total) = store.list(failed, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].id, 2);
    }

    #[tokio::test]
    async fn test_patch_logs_privileged_state_change() {
        let store = InMemoryRequestStore::new();
        let request = store.insert(new_request()).await.unwrap();
        store
            .compare_and_set_state(request.id, RequestState::InProgress, RequestState::Failed, "x", None)
            .await
            .unwrap();
        let patched = store
            .patch(
                request.id,
                RequestPatch {
                    state: Some((RequestState::Complete, "Manually completed".into())),
                    ..Default::default()
                },
                Some("admin".into()),
            )
            .await
            .unwrap();
        assert_eq!(patched.state(), RequestState::Complete);
        assert_eq!(patched.state_history.len(), 3);
        assert_eq!(patched.state_history.last().unwrap().actor.as_deref(), Some("admin"));
        assert!(patched.state_history.is_monotonic());
    }
}
