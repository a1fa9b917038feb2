//! The request service behind the REST surface
//!
//! One method per route. Routing and authentication live outside this crate: the
//! caller arrives as an already authenticated [`Caller`], and every error maps to the
//! route's status through [`VendorError::status_code`]. Submissions validate
//! synchronously and hand the work to the [`JobQueue`]; they never wait for the
//! pipeline.

use crate::bundle::BundleAssembler;
use crate::config::{VendorboxConfig, KNOWN_FLAGS};
use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, NewRequest, Package, Replacement, RequestDetail, RequestView};
use crate::replacements;
use crate::scm::{self, RepoLocation};
use crate::state::RequestState;
use crate::store::{ListFilter, RequestPatch, RequestStore};
use crate::worker::JobQueue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

pub const CANCELLED_REASON: &str = "Cancelled by an administrator";

const DEFAULT_PER_PAGE: usize = 10;

const PATCHABLE_KEYS: &[&str] = &[
    "dependencies",
    "environment_variables",
    "packages",
    "state",
    "state_reason",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Privilege {
    /// May submit requests with `user` set to someone else
    SubmitOnBehalf,
    /// May patch, cancel and retry any request
    Administer,
}

/// An authenticated caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub identity: Option<String>,
    privileges: BTreeSet<Privilege>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            privileges: BTreeSet::new(),
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privileges.insert(privilege);
        self
    }

    pub fn has(&self, privilege: Privilege) -> bool {
        self.privileges.contains(&privilege)
    }

    fn require(&self, privilege: Privilege, action: &str) -> Result<()> {
        if self.has(privilege) {
            return Ok(());
        }
        Err(VendorError::Authorization(format!(
            "{} is not allowed to {}",
            self.identity.as_deref().unwrap_or("An anonymous user"),
            action
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplacementBody {
    pub name: String,
    #[serde(rename = "type")]
    pub ecosystem: String,
    pub version: String,
    pub new_name: String,
}

/// Body of `POST /requests`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRequestBody {
    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub pkg_managers: Option<Vec<String>>,
    #[serde(default)]
    pub dependency_replacements: Vec<ReplacementBody>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub user: Option<String>,
}

impl NewRequestBody {
    pub fn from_json(body: Value) -> Result<Self> {
        if !body.is_object() {
            return Err(VendorError::InvalidInput(
                "The input data must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(body).map_err(|e| VendorError::InvalidInput(e.to_string()))
    }
}

/// Query of `GET /requests`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub state: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RequestItem {
    Summary(RequestView),
    Detail(Box<RequestDetail>),
}

impl RequestItem {
    pub fn id(&self) -> u64 {
        match self {
            RequestItem::Summary(view) => view.id,
            RequestItem::Detail(detail) => detail.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub pages: usize,
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

impl PageMeta {
    pub fn new(page: usize, per_page: usize, total: usize) -> Self {
        let pages = total.div_ceil(per_page);
        Self {
            page,
            per_page,
            total,
            pages,
            previous: (page > 1).then(|| page - 1),
            next: (page < pages).then(|| page + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub items: Vec<RequestItem>,
    pub meta: PageMeta,
}

/// Response of `GET /requests/{id}/download`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDownload {
    pub file_name: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct RequestService {
    store: Arc<dyn RequestStore>,
    queue: JobQueue,
    assembler: BundleAssembler,
    config: Arc<VendorboxConfig>,
}

impl RequestService {
    pub fn new(store: Arc<dyn RequestStore>, queue: JobQueue, config: Arc<VendorboxConfig>) -> Self {
        let assembler = BundleAssembler::new(&config.bundles_dir, config.step_timeout());
        Self {
            store,
            queue,
            assembler,
            config,
        }
    }

    /// `GET /requests`
    pub async fn list(&self, query: ListQuery) -> Result<Page> {
        let state = match query.state.as_deref() {
            Some(tag) => Some(RequestState::from_tag(tag).ok_or_else(|| {
                let valid: Vec<&str> = RequestState::all_variants().iter().map(|s| s.tag()).collect();
                VendorError::InvalidInput(format!(
                    "{} is not a valid request state. Valid states are: {}",
                    tag,
                    valid.join(", ")
                ))
            })?),
            None => None,
        };
        let page = query.page.unwrap_or(1);
        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .min(self.config.max_per_page);
        if page == 0 || per_page == 0 {
            return Err(VendorError::InvalidInput(
                "The page and per_page parameters must be positive".to_string(),
            ));
        }

        let offset = (page - 1).saturating_mul(per_page);
        let (requests, total) = self.store.list(ListFilter { state }, offset, per_page).await?;
        if requests.is_empty() {
            return Err(VendorError::NotFound("No matching requests were found".to_string()));
        }

        let items = requests
            .iter()
            .map(|request| {
                if query.verbose {
                    RequestItem::Detail(Box::new(request.detail()))
                } else {
                    RequestItem::Summary(request.summary())
                }
            })
            .collect();
        Ok(Page {
            items,
            meta: PageMeta::new(page, per_page, total),
        })
    }

    /// `POST /requests`; the route answers 201 with the returned view
    pub async fn create(&self, caller: &Caller, body: NewRequestBody) -> Result<RequestDetail> {
        if body.user.is_some() {
            caller.require(Privilege::SubmitOnBehalf, "submit requests on behalf of another user")?;
        }
        let new = self.validate(caller, body)?;

        let request = self.store.insert(new).await?;
        self.schedule(request.id).await?;
        info!(
            request_id = request.id,
            repo = %request.repo,
            git_ref = %request.git_ref,
            submitted_by = ?request.submitted_by,
            "Request submitted"
        );
        Ok(request.detail())
    }

    fn validate(&self, caller: &Caller, body: NewRequestBody) -> Result<NewRequest> {
        let repo = body
            .repo
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| VendorError::InvalidInput("The \"repo\" parameter is required".to_string()))?;
        let git_ref = body
            .git_ref
            .ok_or_else(|| VendorError::InvalidInput("The \"ref\" parameter is required".to_string()))?;
        scm::validate_ref(&git_ref)?;
        RepoLocation::parse(&repo)?;

        let pkg_managers = match body.pkg_managers {
            None => self.config.default_pkg_managers.clone(),
            Some(names) => parse_ecosystems(&names)?,
        };

        let unknown_flags: Vec<&str> = body
            .flags
            .iter()
            .map(String::as_str)
            .filter(|flag| !KNOWN_FLAGS.contains(flag))
            .collect();
        if !unknown_flags.is_empty() {
            return Err(VendorError::InvalidInput(format!(
                "Invalid flags: {}",
                unknown_flags.join(", ")
            )));
        }

        let dependency_replacements = body
            .dependency_replacements
            .into_iter()
            .map(|r| {
                let ecosystem = Ecosystem::from_tag(&r.ecosystem).ok_or_else(|| {
                    VendorError::InvalidInput(format!(
                        "The dependency replacement type \"{}\" is not supported",
                        r.ecosystem
                    ))
                })?;
                Ok(Replacement::new(r.name, ecosystem, r.version, r.new_name))
            })
            .collect::<Result<Vec<_>>>()?;
        replacements::validate(&dependency_replacements, &pkg_managers)?;

        Ok(NewRequest {
            repo,
            git_ref,
            pkg_managers,
            flags: body.flags.into_iter().collect(),
            dependency_replacements,
            submitted_by: caller.identity.clone(),
            user: body.user.or_else(|| caller.identity.clone()),
        })
    }

    async fn schedule(&self, request_id: u64) -> Result<()> {
        if let Err(e) = self.queue.enqueue(request_id) {
            warn!(request_id, error = %e, "Could not schedule request");
            self.store
                .compare_and_set_state(
                    request_id,
                    RequestState::InProgress,
                    RequestState::Failed,
                    "Failed to schedule the request",
                    None,
                )
                .await?;
            return Err(e);
        }
        Ok(())
    }

    /// `GET /requests/{id}`
    pub async fn get(&self, id: u64) -> Result<RequestDetail> {
        Ok(self.load(id).await?.detail())
    }

    /// `PATCH /requests/{id}`
    pub async fn patch(&self, caller: &Caller, id: u64, body: Value) -> Result<RequestDetail> {
        caller.require(Privilege::Administer, "update requests")?;
        let Value::Object(fields) = body else {
            return Err(VendorError::InvalidInput(
                "The input data must be a JSON object".to_string(),
            ));
        };
        let unknown: Vec<&str> = fields
            .keys()
            .map(String::as_str)
            .filter(|key| !PATCHABLE_KEYS.contains(key))
            .collect();
        if !unknown.is_empty() {
            return Err(VendorError::InvalidInput(format!(
                "The following keys are not allowed: {}",
                unknown.join(", ")
            )));
        }
        if fields.is_empty() {
            return Err(VendorError::InvalidInput(
                "At least one key must be specified to update the request".to_string(),
            ));
        }

        let mut patch = RequestPatch::default();
        match (fields.get("state"), fields.get("state_reason")) {
            (Some(state), Some(reason)) => {
                let state = state
                    .as_str()
                    .and_then(RequestState::from_tag)
                    .ok_or_else(|| VendorError::InvalidInput(format!("{} is not a valid request state", state)))?;
                let reason = reason
                    .as_str()
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| VendorError::InvalidInput("The \"state_reason\" key must be a non-empty string".to_string()))?;
                patch.state = Some((state, reason.to_string()));
            }
            (None, None) => {}
            _ => {
                return Err(VendorError::InvalidInput(
                    "The \"state\" and \"state_reason\" keys must be set together".to_string(),
                ))
            }
        }
        if let Some(value) = fields.get("packages") {
            patch.packages = Some(typed::<BTreeSet<Package>>("packages", value)?);
        }
        if let Some(value) = fields.get("dependencies") {
            patch.dependencies = Some(typed::<BTreeSet<Dependency>>("dependencies", value)?);
        }
        if let Some(value) = fields.get("environment_variables") {
            patch.environment_variables =
                Some(typed::<BTreeMap<String, String>>("environment_variables", value)?);
        }

        let stops_work = matches!(&patch.state, Some((state, _)) if *state != RequestState::InProgress);
        let request = self.store.patch(id, patch, caller.identity.clone()).await?;
        if stops_work && self.queue.cancel(id) {
            info!(request_id = id, "Signalled the running pipeline after a state change");
        }
        info!(request_id = id, actor = ?caller.identity, state = %request.state(), "Request updated");
        Ok(request.detail())
    }

    /// `GET /requests/{id}/download`
    pub async fn download(&self, id: u64) -> Result<BundleDownload> {
        let request = self.load(id).await?;
        let data = self.assembler.open(&request).await?;
        Ok(BundleDownload {
            file_name: format!("vendorbox-{}.tar.gz", id),
            content_type: "application/gzip",
            data,
        })
    }

    /// Administrative cancel; the request ends `failed`
    ///
    /// A request being worked on records the failure once its pipeline observes the
    /// signal, so the returned view can still read `in_progress`.
    pub async fn cancel(&self, caller: &Caller, id: u64) -> Result<RequestDetail> {
        caller.require(Privilege::Administer, "cancel requests")?;
        let request = self.load(id).await?;
        if request.state() != RequestState::InProgress {
            return Err(VendorError::InvalidState(format!(
                "Only requests in the \"{}\" state can be cancelled, the request is \"{}\"",
                RequestState::InProgress,
                request.state()
            )));
        }
        if self.queue.cancel(id) {
            info!(request_id = id, actor = ?caller.identity, "Cancellation signalled");
            return Ok(self.load(id).await?.detail());
        }
        let request = self
            .store
            .compare_and_set_state(
                id,
                RequestState::InProgress,
                RequestState::Failed,
                CANCELLED_REASON,
                caller.identity.clone(),
            )
            .await?;
        Ok(request.detail())
    }

    /// Resubmits a failed or stale request's inputs as a new request
    pub async fn retry(&self, caller: &Caller, id: u64) -> Result<RequestDetail> {
        let original = self.load(id).await?;
        let owns = caller.identity.is_some() && caller.identity == original.submitted_by;
        if !owns {
            caller.require(Privilege::Administer, "retry requests submitted by someone else")?;
        }
        if !matches!(original.state(), RequestState::Failed | RequestState::Stale) {
            return Err(VendorError::InvalidState(format!(
                "Only failed or stale requests can be retried, the request is \"{}\"",
                original.state()
            )));
        }

        let mut new = original.to_new_request();
        new.submitted_by = caller.identity.clone();
        let request = self.store.insert(new).await?;
        self.schedule(request.id).await?;
        info!(request_id = request.id, retry_of = id, "Request retried");
        Ok(request.detail())
    }

    async fn load(&self, id: u64) -> Result<crate::models::Request> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| VendorError::NotFound(format!("The request {} does not exist", id)))
    }
}

fn parse_ecosystems(names: &[String]) -> Result<BTreeSet<Ecosystem>> {
    if names.is_empty() {
        return Err(VendorError::InvalidInput(
            "At least one package manager is required".to_string(),
        ));
    }
    let invalid: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| Ecosystem::from_tag(name).is_none())
        .collect();
    if !invalid.is_empty() {
        return Err(VendorError::InvalidInput(format!(
            "The following package managers are invalid: {}",
            invalid.join(", ")
        )));
    }
    Ok(names.iter().filter_map(|name| Ecosystem::from_tag(name)).collect())
}

fn typed<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| VendorError::InvalidInput(format!("The \"{}\" key is invalid: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRequestStore;
    use crate::worker::Job;
    use tokio::sync::mpsc::UnboundedReceiver;
    use serde_json::json;
    use tempfile::TempDir;
    use yare::parameterized;

    const REF: &str = "0123456789abcdef0123456789abcdef01234567";

    struct Setup {
        _dir: TempDir,
        store: Arc<InMemoryRequestStore>,
        service: RequestService,
        queue: JobQueue,
        jobs: UnboundedReceiver<Job>,
    }

    /// No workers drain the queue, so requests stay `in_progress`
    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(VendorboxConfig::rooted_at(dir.path()));
        let store = Arc::new(InMemoryRequestStore::new());
        let (queue, jobs) = JobQueue::channel();
        let service = RequestService::new(store.clone(), queue.clone(), config);
        Setup {
            _dir: dir,
            store,
            service,
            queue,
            jobs,
        }
    }

    fn body(value: Value) -> NewRequestBody {
        NewRequestBody::from_json(value).unwrap()
    }

    fn admin() -> Caller {
        Caller::user("operator").with_privilege(Privilege::Administer)
    }

    #[tokio::test]
    async fn test_create_defaults_and_queues() {
        let s = setup();
        let detail = s
            .service
            .create(
                &Caller::user("alice"),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap();
        assert_eq!(detail.state, RequestState::InProgress);
        assert_eq!(detail.pkg_managers, vec![Ecosystem::Gomod]);
        assert_eq!(detail.submitted_by.as_deref(), Some("alice"));
        assert_eq!(detail.user.as_deref(), Some("alice"));
        assert!(s.queue.is_active(detail.id));
    }

    #[parameterized(
        short = { "abc123" },
        uppercase = { "0123456789ABCDEF0123456789ABCDEF01234567" },
        branch = { "main" },
        too_long = { "0123456789abcdef0123456789abcdef012345678" },
    )]
    #[test_macro(tokio::test)]
    async fn test_create_rejects_malformed_ref(git_ref: &str) {
        let s = setup();
        let err = s
            .service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": git_ref})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        let (requests, _) = s.store.list(ListFilter::default(), 0, 10).await.unwrap();
        assert!(requests.is_empty());
    }

    #[parameterized(
        unknown_manager = { json!({"repo": "https://github.com/org/app", "ref": REF, "pkg_managers": ["cargo"]}) },
        empty_managers = { json!({"repo": "https://github.com/org/app", "ref": REF, "pkg_managers": []}) },
        unknown_flag = { json!({"repo": "https://github.com/org/app", "ref": REF, "flags": ["turbo"]}) },
        missing_repo = { json!({"ref": REF}) },
        bad_replacement_type = { json!({"repo": "https://github.com/org/app", "ref": REF,
            "dependency_replacements": [{"name": "a", "type": "cargo", "version": "1", "new_name": "b"}]}) },
        replacement_outside_request = { json!({"repo": "https://github.com/org/app", "ref": REF,
            "pkg_managers": ["gomod"],
            "dependency_replacements": [{"name": "a", "type": "npm", "version": "1", "new_name": "b"}]}) },
    )]
    #[test_macro(tokio::test)]
    async fn test_create_rejects_invalid_body(value: Value) {
        let s = setup();
        let err = s.service.create(&Caller::anonymous(), body(value)).await.unwrap_err();
        assert_eq!(err.status_code(), 400, "{}", err);
    }

    #[test]
    fn test_body_must_be_object_without_unknown_keys() {
        assert!(NewRequestBody::from_json(json!(["repo"])).is_err());
        assert!(NewRequestBody::from_json(json!({"repo": "x", "colour": "red"})).is_err());
    }

    #[tokio::test]
    async fn test_on_behalf_of_requires_privilege() {
        let s = setup();
        let request = json!({"repo": "https://github.com/org/app", "ref": REF, "user": "bob"});
        let err = s
            .service
            .create(&Caller::user("alice"), body(request.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let service_account = Caller::user("builder").with_privilege(Privilege::SubmitOnBehalf);
        let detail = s.service.create(&service_account, body(request)).await.unwrap();
        assert_eq!(detail.user.as_deref(), Some("bob"));
        assert_eq!(detail.submitted_by.as_deref(), Some("builder"));
    }

    #[tokio::test]
    async fn test_list_pagination_and_filters() {
        let s = setup();
        for _ in 0..5 {
            s.service
                .create(
                    &Caller::anonymous(),
                    body(json!({"repo": "https://github.com/org/app", "ref": REF})),
                )
                .await
                .unwrap();
        }

        let page = s
            .service
            .list(ListQuery {
                page: Some(2),
                per_page: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.iter().map(RequestItem::id).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(page.meta.pages, 3);
        assert_eq!(page.meta.previous, Some(1));
        assert_eq!(page.meta.next, Some(3));

        let last = s
            .service
            .list(ListQuery {
                page: Some(3),
                per_page: Some(2),
                verbose: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(last.meta.next, None);
        assert!(matches!(last.items[0], RequestItem::Detail(_)));

        let none = s
            .service
            .list(ListQuery {
                state: Some("complete".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(none.status_code(), 404);

        let bad = s
            .service
            .list(ListQuery {
                state: Some("finished".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(bad.status_code(), 400);
    }

    #[test]
    fn test_page_meta_edges() {
        let first = PageMeta::new(1, 10, 25);
        assert_eq!((first.pages, first.previous, first.next), (3, None, Some(2)));
        let only = PageMeta::new(1, 10, 3);
        assert_eq!((only.previous, only.next), (None, None));
    }

    #[tokio::test]
    async fn test_per_page_is_capped() {
        let s = setup();
        s.service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap();
        let page = s
            .service
            .list(ListQuery {
                per_page: Some(10_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.meta.per_page, 100);
    }

    #[tokio::test]
    async fn test_patch_requires_privilege_and_object() {
        let s = setup();
        let detail = s
            .service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap();

        let denied = s
            .service
            .patch(&Caller::user("alice"), detail.id, json!({"state": "failed"}))
            .await
            .unwrap_err();
        assert_eq!(denied.status_code(), 403);

        let not_object = s.service.patch(&admin(), detail.id, json!("failed")).await.unwrap_err();
        assert_eq!(not_object.status_code(), 400);

        let missing = s
            .service
            .patch(&admin(), 404, json!({"state": "failed", "state_reason": "x"}))
            .await
            .unwrap_err();
        assert_eq!(missing.status_code(), 404);

        let unknown_key = s
            .service
            .patch(&admin(), detail.id, json!({"repo": "elsewhere"}))
            .await
            .unwrap_err();
        assert_eq!(unknown_key.status_code(), 400);
    }

    #[tokio::test]
    async fn test_patch_updates_and_logs_actor() {
        let mut s = setup();
        let detail = s
            .service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap();

        let patched = s
            .service
            .patch(
                &admin(),
                detail.id,
                json!({
                    "state": "failed",
                    "state_reason": "Stopped by hand",
                    "environment_variables": {"GOFLAGS": "-mod=mod"},
                    "dependencies": [{"name": "rsc.io/quote", "type": "gomod", "version": "v1.5.2"}]
                }),
            )
            .await
            .unwrap();
        assert_eq!(patched.state, RequestState::Failed);
        assert_eq!(
            patched.state_history.last().and_then(|t| t.actor.as_deref()),
            Some("operator")
        );
        assert_eq!(patched.dependencies.len(), 1);
        assert_eq!(patched.environment_variables["GOFLAGS"], "-mod=mod");
        let job = s.jobs.try_recv().unwrap();
        assert_eq!(job.request_id, detail.id);
        assert!(job.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_download_before_complete_is_invalid_state() {
        let s = setup();
        let detail = s
            .service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap();
        let err = s.service.download(detail.id).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("complete"));
        assert_eq!(s.service.download(99).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_cancel_and_retry() {
        let mut s = setup();
        let detail = s
            .service
            .create(
                &Caller::user("alice"),
                body(json!({"repo": "https://github.com/org/app", "ref": REF, "pkg_managers": ["npm"]})),
            )
            .await
            .unwrap();
        assert_eq!(
            s.service.cancel(&Caller::user("alice"), detail.id).await.unwrap_err().status_code(),
            403
        );
        let signalled = s.service.cancel(&admin(), detail.id).await.unwrap();
        assert_eq!(signalled.state, RequestState::InProgress);
        assert!(s.jobs.try_recv().unwrap().cancel.is_cancelled());

        // The job was dropped without reaching a worker
        s.queue.release(detail.id);
        let cancelled = s.service.cancel(&admin(), detail.id).await.unwrap();
        assert_eq!(cancelled.state, RequestState::Failed);
        assert_eq!(cancelled.state_reason, CANCELLED_REASON);

        let again = s.service.cancel(&admin(), detail.id).await.unwrap_err();
        assert_eq!(again.status_code(), 400);

        let denied = s.service.retry(&Caller::user("mallory"), detail.id).await.unwrap_err();
        assert_eq!(denied.status_code(), 403);
        let retried = s.service.retry(&Caller::user("alice"), detail.id).await.unwrap();
        assert_ne!(retried.id, detail.id);
        assert_eq!(retried.state, RequestState::InProgress);
        assert_eq!(retried.pkg_managers, vec![Ecosystem::Npm]);

        let running = s.service.retry(&admin(), retried.id).await.unwrap_err();
        assert_eq!(running.status_code(), 400);
    }

    #[tokio::test]
    async fn test_closed_queue_fails_the_request() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(VendorboxConfig::rooted_at(dir.path()));
        let store = Arc::new(InMemoryRequestStore::new());
        let (queue, _jobs) = JobQueue::channel();
        queue.close();
        let service = RequestService::new(store.clone(), queue, config);
        let err = service
            .create(
                &Caller::anonymous(),
                body(json!({"repo": "https://github.com/org/app", "ref": REF})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        let stored = store.get(1).await.unwrap().unwrap();
        assert_eq!(stored.state(), RequestState::Failed);
    }
}
