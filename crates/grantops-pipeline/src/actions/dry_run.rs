use async_trait::async_trait;
use grantops_types::{ActionKind, ActionOutcome, Result, TargetRef};

use crate::action::{ActionContext, ActionInterface};

/// Reports success without doing anything. No artifact is produced, so a dry
/// run never creates versions.
pub struct DryRunAction;

#[async_trait]
impl ActionInterface for DryRunAction {
    async fn invoke(
        &self,
        action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        tracing::info!(step = %ctx.step, action = %action, target = %target, "Dry run, action not executed");
        Ok(ActionOutcome::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_without_artifact() {
        let ctx = ActionContext {
            run_id: "r".into(),
            pipeline: "p".into(),
            step: "s".into(),
            attempt: 1,
            section: None,
            current_content: None,
        };
        let out = DryRunAction
            .invoke(ActionKind::Draft, &TargetRef::from("narrative"), &ctx)
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.artifact.is_none());
    }
}
