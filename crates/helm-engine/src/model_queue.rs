//! Deferred model switching.
//!
//! A model change requested while a run is streaming must not take effect
//! until the current turn finishes. Requests land in a single-slot queue that
//! the run loop drains between model calls.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use helm_core::errors::GatewayError;
use helm_core::models::{ModelType, SelectedModel};
use helm_core::provider::{LlmProvider, ProviderFactory};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingModelUpdate {
    pub model_type: ModelType,
    pub model: SelectedModel,
}

/// Holds at most one pending update. Last writer wins.
#[derive(Debug, Default)]
pub struct ModelUpdateQueue {
    slot: Mutex<Option<PendingModelUpdate>>,
}

impl ModelUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any pending update.
    pub fn queue(&self, model_type: ModelType, model: SelectedModel) {
        *self.slot.lock() = Some(PendingModelUpdate { model_type, model });
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn pending(&self) -> Option<PendingModelUpdate> {
        self.slot.lock().clone()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// Remove and return the pending update.
    pub fn take(&self) -> Option<PendingModelUpdate> {
        self.slot.lock().take()
    }

    /// Put `update` back unless a newer one arrived in the meantime.
    fn restore(&self, update: PendingModelUpdate) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(update);
        }
    }
}

struct Slot {
    selected: SelectedModel,
    provider: Arc<dyn LlmProvider>,
}

/// The live large and small providers plus the queue that feeds them.
pub struct ModelSlots {
    large: RwLock<Slot>,
    small: RwLock<Slot>,
    queue: ModelUpdateQueue,
    factory: Arc<dyn ProviderFactory>,
}

impl ModelSlots {
    /// Build both providers through `factory`.
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        large: SelectedModel,
        small: SelectedModel,
    ) -> Result<Self, GatewayError> {
        let large_provider = factory.build(&large)?;
        let small_provider = factory.build(&small)?;
        Ok(Self {
            large: RwLock::new(Slot {
                selected: large,
                provider: large_provider,
            }),
            small: RwLock::new(Slot {
                selected: small,
                provider: small_provider,
            }),
            queue: ModelUpdateQueue::new(),
            factory,
        })
    }

    pub fn queue(&self) -> &ModelUpdateQueue {
        &self.queue
    }

    pub fn large(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.large.read().provider)
    }

    pub fn small(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.small.read().provider)
    }

    pub fn selected(&self, model_type: ModelType) -> SelectedModel {
        match model_type {
            ModelType::Large => self.large.read().selected.clone(),
            ModelType::Small => self.small.read().selected.clone(),
        }
    }

    /// Build a provider for the selection without touching either slot.
    pub fn build(&self, model: &SelectedModel) -> Result<Arc<dyn LlmProvider>, GatewayError> {
        self.factory.build(model)
    }

    /// Apply the pending update, if any. On a build failure the update is put
    /// back (unless superseded) and the current providers stay in place.
    pub fn apply_pending(&self) -> Result<Option<PendingModelUpdate>, GatewayError> {
        let Some(update) = self.queue.take() else {
            return Ok(None);
        };
        let provider = match self.factory.build(&update.model) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    model_type = %update.model_type,
                    model = %update.model,
                    error = %e,
                    "failed to build queued model"
                );
                self.queue.restore(update);
                return Err(e);
            }
        };
        let slot = match update.model_type {
            ModelType::Large => &self.large,
            ModelType::Small => &self.small,
        };
        *slot.write() = Slot {
            selected: update.model.clone(),
            provider,
        };
        info!(model_type = %update.model_type, model = %update.model, "model switched");
        Ok(Some(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_llm::mock::{MockProvider, MockProviderFactory};

    fn factory() -> Arc<MockProviderFactory> {
        let f = Arc::new(MockProviderFactory::new());
        for m in ["large", "small", "other"] {
            f.register(m, Arc::new(MockProvider::new(vec![]).with_model("mock", m)));
        }
        f
    }

    fn slots() -> ModelSlots {
        ModelSlots::new(
            factory(),
            SelectedModel::new("mock", "large"),
            SelectedModel::new("mock", "small"),
        )
        .unwrap()
    }

    #[test]
    fn last_write_wins() {
        let q = ModelUpdateQueue::new();
        q.queue(ModelType::Large, SelectedModel::new("a", "one"));
        q.queue(ModelType::Small, SelectedModel::new("b", "two"));
        assert!(q.has_pending());
        assert_eq!(
            q.pending(),
            Some(PendingModelUpdate {
                model_type: ModelType::Small,
                model: SelectedModel::new("b", "two"),
            })
        );
        q.clear();
        assert!(!q.has_pending());
        assert!(q.take().is_none());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let q = Arc::new(ModelUpdateQueue::new());
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let ty = if i % 2 == 0 { ModelType::Large } else { ModelType::Small };
                    q.queue(ty, SelectedModel::new("p", format!("m{i}")));
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert!(q.has_pending());

        let readers: Vec<_> = (0..20)
            .map(|i| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    if let Some(p) = q.pending() {
                        // A torn read would pair a model with the wrong type.
                        let n: usize = p.model.model[1..].parse().unwrap();
                        let expected = if n % 2 == 0 { ModelType::Large } else { ModelType::Small };
                        assert_eq!(p.model_type, expected);
                    }
                    if i % 5 == 0 {
                        q.clear();
                    }
                    q.has_pending()
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn apply_pending_swaps_slot() {
        let slots = slots();
        assert_eq!(slots.large().model(), "large");
        slots.queue().queue(ModelType::Large, SelectedModel::new("mock", "other"));
        let applied = slots.apply_pending().unwrap().unwrap();
        assert_eq!(applied.model.model, "other");
        assert_eq!(slots.large().model(), "other");
        assert_eq!(slots.small().model(), "small");
        assert!(!slots.queue().has_pending());
        assert!(slots.apply_pending().unwrap().is_none());
    }

    #[test]
    fn failed_build_keeps_update_and_provider() {
        let slots = slots();
        slots.queue().queue(ModelType::Small, SelectedModel::new("mock", "missing"));
        assert!(slots.apply_pending().is_err());
        assert!(slots.queue().has_pending());
        assert_eq!(slots.small().model(), "small");
    }
}
