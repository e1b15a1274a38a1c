//! Operator review of flagged and failed tasks.
//!
//! Every action goes through an [`Authorizer`] first. Denials are written to
//! the bot audit as `<action>_denied`; allowed actions are audited by the
//! store in the same transaction as the state change.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{JobStore, StoreError, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewAction {
    Approve,
    Rerun,
    Reenqueue,
    ResetAttempts,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Rerun => "rerun",
            ReviewAction::Reenqueue => "reenqueue",
            ReviewAction::ResetAttempts => "reset_attempts",
        }
    }
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External permission check for operator actions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, actor: &str, action: ReviewAction, task_id: i64) -> bool;
}

/// Allows a fixed set of operator names for every action.
#[derive(Debug, Clone, Default)]
pub struct OperatorList {
    operators: HashSet<String>,
}

impl OperatorList {
    pub fn new(operators: impl IntoIterator<Item = String>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for OperatorList {
    async fn authorize(&self, actor: &str, _action: ReviewAction, _task_id: i64) -> bool {
        self.operators.contains(actor)
    }
}

/// Whether a flagged task may be approved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// Approve regardless of the recorded corrections.
    #[default]
    AllowWithCorrections,
    /// Only approve when the latest sanitizer pass made no corrections;
    /// otherwise the task must be rerun.
    RequireCleanAudit,
}

impl ApprovalPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow_with_corrections" | "allow" => Some(ApprovalPolicy::AllowWithCorrections),
            "require_clean_audit" | "clean" => Some(ApprovalPolicy::RequireCleanAudit),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{actor} is not authorized to {action} task {task_id}")]
    Unauthorized {
        actor: String,
        action: ReviewAction,
        task_id: i64,
    },

    #[error("approval blocked: {0}")]
    Blocked(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ReviewService {
    store: Arc<dyn JobStore>,
    authorizer: Arc<dyn Authorizer>,
    policy: ApprovalPolicy,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn JobStore>,
        authorizer: Arc<dyn Authorizer>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            authorizer,
            policy,
        }
    }

    async fn check(&self, actor: &str, action: ReviewAction, task_id: i64) -> Result<(), ReviewError> {
        if self.authorizer.authorize(actor, action, task_id).await {
            return Ok(());
        }
        tracing::warn!(actor, action = %action, task_id, "Review action denied");
        self.store
            .record_bot_audit(actor, &format!("{}_denied", action), &format!("task={}", task_id))
            .await?;
        Err(ReviewError::Unauthorized {
            actor: actor.to_string(),
            action,
            task_id,
        })
    }

    /// `flagged -> completed`.
    pub async fn approve(&self, task_id: i64, actor: &str) -> Result<(), ReviewError> {
        self.check(actor, ReviewAction::Approve, task_id).await?;

        if self.policy == ApprovalPolicy::RequireCleanAudit {
            let task = self
                .store
                .get(task_id)
                .await?
                .ok_or(StoreError::NotFound(task_id))?;
            if task.status == TaskStatus::Flagged {
                let audits = self.store.sanitizer_audits(task_id).await?;
                if let Some(latest) = audits.last().filter(|a| a.corrections > 0) {
                    return Err(ReviewError::Blocked(format!(
                        "latest sanitizer pass on task {} made {} correction(s); rerun instead",
                        task_id, latest.corrections
                    )));
                }
            }
        }

        self.store.approve(task_id, actor).await?;
        tracing::info!(task_id, actor, "Task approved");
        Ok(())
    }

    /// Copy a flagged or failed task into a new pending task.
    pub async fn rerun(&self, task_id: i64, actor: &str) -> Result<i64, ReviewError> {
        self.check(actor, ReviewAction::Rerun, task_id).await?;
        let new_id = self.store.rerun(task_id, actor).await?;
        tracing::info!(task_id, new_task_id = new_id, actor, "Task rerun");
        Ok(new_id)
    }

    /// `flagged -> pending` on the same task.
    pub async fn reenqueue(&self, task_id: i64, actor: &str) -> Result<(), ReviewError> {
        self.check(actor, ReviewAction::Reenqueue, task_id).await?;
        self.store.reenqueue(task_id, actor).await?;
        tracing::info!(task_id, actor, "Task re-enqueued");
        Ok(())
    }

    pub async fn reset_attempts(&self, task_id: i64, actor: &str) -> Result<(), ReviewError> {
        self.check(actor, ReviewAction::ResetAttempts, task_id).await?;
        self.store.reset_attempts(task_id, actor).await?;
        tracing::info!(task_id, actor, "Task attempts reset");
        Ok(())
    }
}
