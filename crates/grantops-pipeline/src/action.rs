//! The boundary between the engine and whatever drafts, parses and evaluates
//! content, plus a registry dispatching by [`ActionKind`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use grantops_types::{ActionKind, ActionOutcome, GrantOpsError, Result, TargetRef};
use grantops_versions::SectionSnapshot;

/// What an action is told about the step invoking it.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: String,
    pub pipeline: String,
    pub step: String,
    /// 1-based.
    pub attempt: u32,
    /// The target section as it was before this attempt; `None` for `all`.
    pub section: Option<SectionSnapshot>,
    /// Content of the target's current version, if it has one.
    pub current_content: Option<String>,
}

/// External collaborator performing the work of a step.
///
/// Returning `Err` and returning a failed [`ActionOutcome`] are treated alike:
/// the attempt failed. The engine never inspects `artifact` beyond handing it
/// to the version store.
#[async_trait]
pub trait ActionInterface: Send + Sync {
    async fn invoke(
        &self,
        action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome>;
}

#[async_trait]
impl<T: ActionInterface + ?Sized> ActionInterface for Arc<T> {
    async fn invoke(
        &self,
        action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        (**self).invoke(action, target, ctx).await
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Routes each [`ActionKind`] to its own implementation.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionKind, Arc<dyn ActionInterface>>,
    fallback: Option<Arc<dyn ActionInterface>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ActionKind, action: impl ActionInterface + 'static) {
        self.actions.insert(kind, Arc::new(action));
    }

    /// Used for kinds without a registered implementation.
    pub fn set_fallback(&mut self, action: impl ActionInterface + 'static) {
        self.fallback = Some(Arc::new(action));
    }

    pub fn has(&self, kind: ActionKind) -> bool {
        self.actions.contains_key(&kind) || self.fallback.is_some()
    }

    fn resolve(&self, kind: ActionKind) -> Option<&Arc<dyn ActionInterface>> {
        self.actions.get(&kind).or(self.fallback.as_ref())
    }
}

#[async_trait]
impl ActionInterface for ActionRegistry {
    async fn invoke(
        &self,
        action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        let handler = self
            .resolve(action)
            .ok_or_else(|| GrantOpsError::ActionFailed {
                step: ctx.step.clone(),
                action: action.to_string(),
                target: target.to_string(),
                message: format!("no implementation registered for action '{action}'"),
            })?;
        handler.invoke(action, target, ctx).await
    }
}
