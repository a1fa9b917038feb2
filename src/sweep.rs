//! Marks requests that stopped making progress as stale

use crate::error::{Result, VendorError};
use crate::progress::{NoOpHandler, ProgressEvent, ProgressHandler};
use crate::state::RequestState;
use crate::store::{ListFilter, RequestStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const STALE_REASON: &str = "The request has become stale";

const PAGE: usize = 100;

pub struct StaleSweeper {
    store: Arc<dyn RequestStore>,
    stale_after: Duration,
    progress: Arc<dyn ProgressHandler>,
}

impl StaleSweeper {
    pub fn new(store: Arc<dyn RequestStore>, stale_after: Duration) -> Self {
        Self {
            store,
            stale_after,
            progress: Arc::new(NoOpHandler),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    /// Moves every `in_progress` request last updated before `now - stale_after` to
    /// `stale` and returns their ids
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<u64>> {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| VendorError::Internal(format!("Invalid stale threshold: {}", e)))?;
        let cutoff = now - threshold;
        let filter = ListFilter {
            state: Some(RequestState::InProgress),
        };

        let mut candidates = Vec::new();
        let mut offset = 0;
        loop {
            let (page, total) = self.store.list(filter, offset, PAGE).await?;
            let seen = page.len();
            candidates.extend(
                page.into_iter()
                    .filter(|r| r.last_updated() < cutoff)
                    .map(|r| r.id),
            );
            offset += seen;
            if seen == 0 || offset >= total {
                break;
            }
        }

        let mut marked = Vec::new();
        for id in candidates {
            let outcome = self
                .store
                .compare_and_set_state(id, RequestState::InProgress, RequestState::Stale, STALE_REASON, None)
                .await;
            match outcome {
                Ok(_) => {
                    self.progress
                        .on_progress(&ProgressEvent::MarkedStale { request_id: id });
                    marked.push(id);
                }
                // Finished between the listing and the write
                Err(VendorError::InvalidState(_)) => {
                    debug!(request_id = id, "Request left in_progress before it was swept")
                }
                Err(e) => return Err(e),
            }
        }

        if !marked.is_empty() {
            info!(count = marked.len(), "Marked requests as stale");
        }
        Ok(marked)
    }

    /// Sweeps every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %e, "Stale sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Stale sweep stopped");
    }
}
