//! Cancellation and deadlines for the pipeline's suspension points

use crate::error::{Result, VendorError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Observes an administrative cancellation of one request
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pending forever otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VendorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one suspension point bounded by `timeout` and by cancellation
    pub async fn guard<T, F>(&self, step: &str, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let mut signal = self.clone();
        tokio::select! {
            _ = signal.cancelled() => Err(VendorError::Cancelled),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(VendorError::Timeout {
                    step: step.to_string(),
                    seconds: timeout.as_secs(),
                }),
            },
        }
    }
}

/// Hands out one cancellation channel per in-flight request
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    senders: Arc<Mutex<HashMap<u64, watch::Sender<bool>>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: u64) -> CancelSignal {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(request_id, tx);
        }
        CancelSignal { rx }
    }

    /// Returns false when the request is not running
    pub fn cancel(&self, request_id: u64) -> bool {
        let Ok(senders) = self.senders.lock() else {
            return false;
        };
        match senders.get(&request_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    pub fn release(&self, request_id: u64) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&request_id);
        }
    }

    pub fn is_running(&self, request_id: u64) -> bool {
        self.senders
            .lock()
            .map(|senders| senders.contains_key(&request_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_through_result() {
        let signal = CancelSignal::never();
        let value = signal
            .guard("step", Duration::from_secs(1), async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_guard_times_out() {
        let signal = CancelSignal::never();
        let result: Result<()> = signal
            .guard("clone", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(VendorError::Timeout { step, .. }) => assert_eq!(step, "clone"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_step() {
        let registry = CancellationRegistry::new();
        let signal = registry.register(9);
        assert!(registry.is_running(9));

        let handle = tokio::spawn(async move {
            signal
                .guard("download", Duration::from_secs(30), async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.cancel(9));
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(VendorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_signal_fails_fast() {
        let registry = CancellationRegistry::new();
        let signal = registry.register(1);
        registry.cancel(1);
        assert!(signal.check().is_err());
        let result = signal
            .guard("step", Duration::from_secs(1), async { Ok(()) })
            .await;
        assert!(matches!(result, Err(VendorError::Cancelled)));
    }

    #[test]
    fn test_cancel_unknown_request() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(404));
        let _signal = registry.register(1);
        registry.release(1);
        assert!(!registry.is_running(1));
    }
}
