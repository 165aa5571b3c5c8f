use crate::core::config::ConductorConfig;
use crate::core::plan_graph::adapter::AdapterRegistry;
use crate::core::plan_graph::approval::ApprovalController;
use crate::core::plan_graph::checkpoint::CheckpointStore;
use crate::core::plan_graph::expression::{ExpressionEvaluator, DEFAULT_CACHE_CAPACITY};
use crate::core::plan_graph::observer::LifecycleObserver;
use crate::core::plan_graph::state::SharedState;
use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative stop signal shared between a run and whoever supervises it.
#[derive(Clone, Debug)]
pub struct CancellationFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the flag so the context can be reused for another run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Engine switches resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub checkpoint_on_each_node: bool,
    pub evaluator_cache_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            checkpoint_on_each_node: true,
            evaluator_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl From<&ConductorConfig> for EngineSettings {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            checkpoint_on_each_node: config.engine.checkpoint_on_each_node,
            evaluator_cache_capacity: config.evaluator.cache_capacity,
        }
    }
}

/// Everything one execution needs besides the plan itself.
pub struct ExecutionContext {
    pub shared_state: SharedState,
    pub adapters: AdapterRegistry,
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub approvals: Option<Arc<ApprovalController>>,
    pub observer: Option<Arc<dyn LifecycleObserver>>,
    pub settings: EngineSettings,
    pub cancel: CancellationFlag,
    pub evaluator: Arc<ExpressionEvaluator>,
}

impl ExecutionContext {
    pub fn new(adapters: AdapterRegistry) -> Self {
        let settings = EngineSettings::default();
        Self {
            shared_state: SharedState::new(),
            adapters,
            checkpoint_store: None,
            approvals: None,
            observer: None,
            evaluator: Arc::new(ExpressionEvaluator::new(settings.evaluator_cache_capacity)),
            settings,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_shared_state(mut self, shared_state: SharedState) -> Self {
        self.shared_state = shared_state;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalController>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        if settings.evaluator_cache_capacity != self.settings.evaluator_cache_capacity {
            self.evaluator = Arc::new(ExpressionEvaluator::new(settings.evaluator_cache_capacity));
        }
        self.settings = settings;
        self
    }
}
