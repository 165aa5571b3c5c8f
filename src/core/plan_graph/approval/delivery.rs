#![allow(clippy::result_large_err)] // Delivery strategies return AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::plan_graph::approval::store::ApprovalStore;
use crate::core::plan_graph::approval::CompletedApprovalEntry;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Strategy used to block until a decision exists for an approval id.
///
/// Implementations must check the store before waiting so a decision
/// recorded ahead of the wait is never missed.
#[async_trait]
pub trait DecisionDelivery: Send + Sync {
    fn name(&self) -> &'static str;

    async fn wait_for_decision(&self, id: &str) -> Result<CompletedApprovalEntry, AppError>;

    /// Called by the controller right after a decision is persisted in-process.
    fn decision_recorded(&self, _entry: &CompletedApprovalEntry) {}
}

/// Re-reads the store at a fixed interval until the decision appears.
pub struct PollingDelivery {
    store: Arc<dyn ApprovalStore>,
    interval: Duration,
}

impl PollingDelivery {
    pub fn new(store: Arc<dyn ApprovalStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
impl DecisionDelivery for PollingDelivery {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn wait_for_decision(&self, id: &str) -> Result<CompletedApprovalEntry, AppError> {
        loop {
            if let Some(entry) = self.store.find_decision(id)? {
                return Ok(entry);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

type Waiters = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<CompletedApprovalEntry>>>>>;

/// Resolves in-memory waiters when the store directory changes or when a
/// decision is recorded in this process.
pub struct WatchDelivery {
    store: Arc<dyn ApprovalStore>,
    waiters: Waiters,
    _watcher: Mutex<Option<PollWatcher>>,
}

impl WatchDelivery {
    /// Watch `store.watch_path()` (if any), scanning it every `interval`.
    pub fn new(store: Arc<dyn ApprovalStore>, interval: Duration) -> Result<Self, AppError> {
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let watcher = match store.watch_path() {
            Some(path) => {
                let callback_store = Arc::clone(&store);
                let callback_waiters = Arc::clone(&waiters);
                let mut watcher = PollWatcher::new(
                    move |res: Result<NotifyEvent, notify::Error>| match res {
                        Ok(event) => {
                            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                                resolve_from_store(callback_store.as_ref(), &callback_waiters);
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "approval store watcher error"),
                    },
                    notify::Config::default().with_poll_interval(interval),
                )
                .map_err(watch_error)?;
                watcher
                    .watch(&path, RecursiveMode::NonRecursive)
                    .map_err(watch_error)?;
                tracing::debug!(path = %path.display(), "watching approval store");
                Some(watcher)
            }
            None => None,
        };
        Ok(Self {
            store,
            waiters,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Number of ids with at least one live waiter.
    pub fn waiting_ids(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|senders| senders.iter().any(|tx| !tx.is_closed()))
            .count()
    }
}

fn watch_error(err: notify::Error) -> AppError {
    AppError::new(
        ErrorCategory::ApprovalError,
        format!("failed to watch approval store: {}", err),
    )
    .with_code("PLN-APPR-004")
}

fn resolve_from_store(store: &dyn ApprovalStore, waiters: &Waiters) {
    let mut waiters = waiters.lock().unwrap_or_else(|p| p.into_inner());
    waiters.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
    let ids: Vec<String> = waiters.keys().cloned().collect();
    for id in ids {
        match store.find_decision(&id) {
            Ok(Some(entry)) => {
                if let Some(senders) = waiters.remove(&id) {
                    for tx in senders {
                        let _ = tx.send(entry.clone());
                    }
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(approval_id = %id, error = %err, "failed to read decision"),
        }
    }
}

/// Registered interest in one id; dropping it unregisters closed senders.
struct Waiter<'a> {
    id: &'a str,
    waiters: &'a Waiters,
    rx: oneshot::Receiver<CompletedApprovalEntry>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(senders) = waiters.get_mut(self.id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiters.remove(self.id);
            }
        }
    }
}

#[async_trait]
impl DecisionDelivery for WatchDelivery {
    fn name(&self) -> &'static str {
        "watch"
    }

    async fn wait_for_decision(&self, id: &str) -> Result<CompletedApprovalEntry, AppError> {
        let rx = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = self.store.find_decision(id)? {
                return Ok(entry);
            }
            let (tx, rx) = oneshot::channel();
            let senders = waiters.entry(id.to_string()).or_default();
            senders.retain(|sender| !sender.is_closed());
            senders.push(tx);
            rx
        };
        let mut waiter = Waiter {
            id,
            waiters: &self.waiters,
            rx,
        };
        (&mut waiter.rx).await.map_err(|_| {
            AppError::new(
                ErrorCategory::ApprovalError,
                format!("approval waiter for {} was dropped", id),
            )
            .with_code("PLN-APPR-004")
        })
    }

    fn decision_recorded(&self, entry: &CompletedApprovalEntry) {
        let senders = self
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&entry.pending.id);
        for tx in senders.into_iter().flatten() {
            let _ = tx.send(entry.clone());
        }
    }
}
