//! Higher-level actions and their handlers.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use thiserror::Error;

use super::TaskError;
use crate::store::{JobStore, NewTask};
use crate::util::{now_string, truncate_chars};

const MAX_TITLE_CHARS: usize = 80;

static ACTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:[-*•][ \t]*)?(research|fetch[ _]data|data[ _]fetch|monitor|alert)\b[ \t]*[:\-]?[ \t]*(\S.*?)[ \t]*$",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Research,
    DataFetch,
    Monitor,
    Alert,
    Generate,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::Research,
        ActionType::DataFetch,
        ActionType::Monitor,
        ActionType::Alert,
        ActionType::Generate,
    ];

    /// Types that [`extract_actions`] can produce.
    pub const EXTRACTED: [ActionType; 4] = [
        ActionType::Research,
        ActionType::DataFetch,
        ActionType::Monitor,
        ActionType::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Research => "RESEARCH",
            ActionType::DataFetch => "DATA_FETCH",
            ActionType::Monitor => "MONITOR",
            ActionType::Alert => "ALERT",
            ActionType::Generate => "GENERATE",
        }
    }

    /// Accepts tags (`DATA_FETCH`) and the spellings used in reports
    /// (`fetch data`), case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(' ', "_").as_str() {
            "research" => Some(ActionType::Research),
            "data_fetch" | "fetch_data" => Some(ActionType::DataFetch),
            "monitor" => Some(ActionType::Monitor),
            "alert" => Some(ActionType::Alert),
            "generate" => Some(ActionType::Generate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action_type: ActionType,
    pub title: String,
    pub description: String,
    /// Task whose output produced this action, if any.
    pub source_task: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl Action {
    pub fn new(
        id: impl Into<String>,
        action_type: ActionType,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            action_type,
            title: title.into(),
            description: description.into(),
            source_task: None,
            payload: serde_json::Value::Null,
            created_at: now_string(),
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The single action type this handler serves.
    fn action_type(&self) -> ActionType;

    async fn handle(&self, action: &Action) -> Result<serde_json::Value, TaskError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler already registered for {0}")]
    Duplicate(ActionType),

    #[error("no handler registered for {0}")]
    Missing(ActionType),
}

/// One handler per action type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Result<(), RegistryError> {
        let action_type = handler.action_type();
        if self.handlers.contains_key(&action_type) {
            return Err(RegistryError::Duplicate(action_type));
        }
        self.handlers.insert(action_type, handler);
        Ok(())
    }

    pub fn get(&self, action_type: ActionType) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&action_type)
    }

    /// Fails on the first of `required` without a handler.
    pub fn ensure_covers(&self, required: &[ActionType]) -> Result<(), RegistryError> {
        match required.iter().find(|t| !self.handlers.contains_key(t)) {
            Some(&missing) => Err(RegistryError::Missing(missing)),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A registry that turns every action type into a queued `generate` task.
pub fn enqueue_registry(store: Arc<dyn JobStore>) -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    for action_type in ActionType::ALL {
        registry.register(Arc::new(EnqueueTaskHandler::new(store.clone(), action_type)))?;
    }
    registry.ensure_covers(&ActionType::EXTRACTED)?;
    Ok(registry)
}

/// In-memory queue of actions awaiting execution. Safe to share between
/// threads; ids are unique per queue.
#[derive(Debug, Default)]
pub struct ActionQueue {
    next_id: AtomicU64,
    pending: Mutex<VecDeque<Action>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ACT-000001`, `ACT-000002`, ...
    pub fn next_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("ACT-{:06}", n)
    }

    /// Create and enqueue an action, returning its id.
    pub fn push(
        &self,
        action_type: ActionType,
        title: impl Into<String>,
        description: impl Into<String>,
        source_task: Option<i64>,
    ) -> String {
        let mut action = Action::new(self.next_id(), action_type, title, description);
        action.source_task = source_task;
        let id = action.id.clone();
        self.push_action(action);
        id
    }

    pub fn push_action(&self, action: Action) {
        self.lock().push_back(action);
    }

    /// Take every pending action, oldest first.
    pub fn drain(&self) -> Vec<Action> {
        self.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<Action> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Action>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Queue every action line in `text` and return the new ids in order.
///
/// Recognised lines start (after an optional bullet) with `Research`,
/// `Fetch Data`/`Data_Fetch`, `Monitor` or `Alert`.
pub fn extract_actions(text: &str, source_task: Option<i64>, queue: &ActionQueue) -> Vec<String> {
    ACTION_LINE
        .captures_iter(text)
        .filter_map(|caps| {
            let action_type = ActionType::parse(caps.get(1)?.as_str())?;
            let body = caps.get(2)?.as_str();
            let title = truncate_chars(body, MAX_TITLE_CHARS);
            Some(queue.push(action_type, title, body, source_task))
        })
        .collect()
}

/// Turns an action into a `generate` task on the queue.
pub struct EnqueueTaskHandler {
    store: Arc<dyn JobStore>,
    action_type: ActionType,
}

impl EnqueueTaskHandler {
    pub fn new(store: Arc<dyn JobStore>, action_type: ActionType) -> Self {
        Self { store, action_type }
    }
}

#[async_trait]
impl ActionHandler for EnqueueTaskHandler {
    fn action_type(&self) -> ActionType {
        self.action_type
    }

    async fn handle(&self, action: &Action) -> Result<serde_json::Value, TaskError> {
        let prompt = format!("{}\n\n{}", action.title, action.description);
        let task_id = self
            .store
            .add(NewTask::generate(format!("actions/{}", action.id), prompt))
            .await?;
        tracing::info!(action_id = %action.id, task_id, "Action enqueued as task");
        Ok(serde_json::json!({ "task_id": task_id }))
    }
}
