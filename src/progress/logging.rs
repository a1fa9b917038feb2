//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started {
                request_id,
                repo,
                git_ref,
            } => {
                info!(request_id, repo = %repo, git_ref = %git_ref, "Processing request");
            }
            ProgressEvent::PhaseStarted {
                request_id,
                phase,
                reason,
            } => {
                info!(request_id, phase, reason = %reason, "Phase started");
            }
            ProgressEvent::PhaseCompleted {
                request_id,
                phase,
                duration,
            } => {
                debug!(
                    request_id,
                    phase,
                    duration_ms = duration.as_millis(),
                    "Phase complete"
                );
            }
            ProgressEvent::SourceReady {
                request_id,
                cache_hit,
            } => {
                debug!(request_id, cache_hit, "Application source ready");
            }
            ProgressEvent::EcosystemResolved {
                request_id,
                ecosystem,
                dependencies,
                duration,
            } => {
                info!(
                    request_id,
                    ecosystem = %ecosystem,
                    dependencies,
                    duration_ms = duration.as_millis(),
                    "Dependencies resolved"
                );
            }
            ProgressEvent::BundlePublished {
                request_id,
                sha256,
                size,
            } => {
                info!(request_id, sha256 = %sha256, size, "Bundle published");
            }
            ProgressEvent::Completed {
                request_id,
                total_time,
            } => {
                info!(
                    request_id,
                    total_time_ms = total_time.as_millis(),
                    "Request complete"
                );
            }
            ProgressEvent::Failed { request_id, reason } => {
                warn!(request_id, reason = %reason, "Request failed");
            }
            ProgressEvent::MarkedStale { request_id } => {
                warn!(request_id, "Request marked stale");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ecosystem;
    use std::time::Duration;

    #[test]
    fn test_logging_all_events() {
        let handler = LoggingHandler;

        let events = vec![
            ProgressEvent::Started {
                request_id: 1,
                repo: "https://github.com/org/app".to_string(),
                git_ref: "a".repeat(40),
            },
            ProgressEvent::PhaseStarted {
                request_id: 1,
                phase: "fetch",
                reason: "Fetching the application source".to_string(),
            },
            ProgressEvent::PhaseCompleted {
                request_id: 1,
                phase: "fetch",
                duration: Duration::from_millis(10),
            },
            ProgressEvent::SourceReady {
                request_id: 1,
                cache_hit: true,
            },
            ProgressEvent::EcosystemResolved {
                request_id: 1,
                ecosystem: Ecosystem::Npm,
                dependencies: 4,
                duration: Duration::from_millis(30),
            },
            ProgressEvent::BundlePublished {
                request_id: 1,
                sha256: "00".repeat(32),
                size: 10,
            },
            ProgressEvent::Completed {
                request_id: 1,
                total_time: Duration::from_secs(1),
            },
            ProgressEvent::Failed {
                request_id: 2,
                reason: "Cancelled by an administrator".to_string(),
            },
            ProgressEvent::MarkedStale { request_id: 3 },
        ];

        for event in events {
            handler.on_progress(&event);
        }
    }
}
