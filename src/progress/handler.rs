//! Progress handler trait and events

use crate::models::Ecosystem;
use std::sync::Mutex;
use std::time::Duration;

/// Events emitted while a request moves through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A worker picked the request up
    Started {
        request_id: u64,
        repo: String,
        git_ref: String,
    },

    /// A phase began; `reason` is what the request's state reason now says
    PhaseStarted {
        request_id: u64,
        phase: &'static str,
        reason: String,
    },

    PhaseCompleted {
        request_id: u64,
        phase: &'static str,
        duration: Duration,
    },

    /// The application source is available in the working directory
    SourceReady { request_id: u64, cache_hit: bool },

    /// One ecosystem finished resolving
    EcosystemResolved {
        request_id: u64,
        ecosystem: Ecosystem,
        dependencies: usize,
        duration: Duration,
    },

    BundlePublished {
        request_id: u64,
        sha256: String,
        size: u64,
    },

    Completed { request_id: u64, total_time: Duration },

    Failed { request_id: u64, reason: String },

    /// The sweep gave up on a request that stopped making progress
    MarkedStale { request_id: u64 },
}

/// Trait for handling progress events during request processing
pub trait ProgressHandler: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Keeps every event, for assertions
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn phases(&self, request_id: u64) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::PhaseStarted {
                    request_id: id,
                    phase,
                    ..
                } if id == request_id => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
