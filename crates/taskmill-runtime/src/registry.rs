//! Reactive task definitions and the in-memory registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use taskmill_core::task::{CleanupPolicy, Evolution, TaskBinding, DEFAULT_EXECUTION_HISTORY_LIMIT};
use taskmill_core::{Error, Filter, Result, RetryPolicy, SchedulerConfig};

use crate::context::TaskContext;

pub type TaskHandler =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A handler invocation passed through the user-supplied caller wrapper.
pub struct TaskCall {
    pub task: String,
    pub invoke: BoxFuture<'static, anyhow::Result<()>>,
}

/// Wrapper around every reactive handler invocation; the default simply
/// awaits it. Embedders use this for tracing spans, panic fences, and
/// request-scoped context.
pub type TaskCaller = Arc<dyn Fn(TaskCall) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn default_task_caller() -> TaskCaller {
    Arc::new(|call: TaskCall| call.invoke)
}

/// A reactive task definition as supplied by the embedder.
#[derive(Clone)]
pub struct ReactiveTaskDef {
    pub task: String,
    pub collection: String,
    pub filter: Filter,
    pub watch_projection: Option<Vec<String>>,
    pub handler: TaskHandler,
    /// Overrides the engine-level debounce when set.
    pub debounce: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub evolution: Evolution,
    pub cleanup_policy: CleanupPolicy,
    pub execution_history_limit: usize,
    /// Overrides the shared work-item collection when set.
    pub tasks_collection: Option<String>,
}

impl ReactiveTaskDef {
    pub fn new<F, Fut>(task: impl Into<String>, collection: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            task: task.into(),
            collection: collection.into(),
            filter: Filter::default(),
            watch_projection: None,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            debounce: None,
            retry_policy: RetryPolicy::default(),
            evolution: Evolution::default(),
            cleanup_policy: CleanupPolicy::default(),
            execution_history_limit: DEFAULT_EXECUTION_HISTORY_LIMIT,
            tasks_collection: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<Filter>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Fields whose changes re-trigger the task. Without a projection an
    /// item runs once per appearance and updates do not re-trigger it.
    pub fn watch(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.watch_projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn evolution(mut self, evolution: Evolution) -> Self {
        self.evolution = evolution;
        self
    }

    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    pub fn execution_history_limit(mut self, limit: usize) -> Self {
        self.execution_history_limit = limit;
        self
    }

    pub fn tasks_collection(mut self, collection: impl Into<String>) -> Self {
        self.tasks_collection = Some(collection.into());
        self
    }
}

/// A registered task with every engine-level default resolved.
pub struct ReactiveTask {
    pub name: String,
    pub source_collection: String,
    pub tasks_collection: String,
    pub filter: Filter,
    pub watch_projection: Option<Vec<String>>,
    pub handler: TaskHandler,
    pub debounce: Duration,
    pub retry_policy: RetryPolicy,
    pub evolution: Evolution,
    pub cleanup_policy: CleanupPolicy,
    pub execution_history_limit: usize,
}

impl ReactiveTask {
    pub fn binding(&self) -> TaskBinding {
        TaskBinding {
            name: self.name.clone(),
            source_collection: self.source_collection.clone(),
            tasks_collection: self.tasks_collection.clone(),
            filter: self.filter.clone(),
            watch_projection: self.watch_projection.clone(),
        }
    }
}

/// In-memory map of registered reactive tasks.
#[derive(Default)]
pub struct ReactiveRegistry {
    tasks: RwLock<BTreeMap<String, Arc<ReactiveTask>>>,
}

impl ReactiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: ReactiveTaskDef, config: &SchedulerConfig) -> Result<()> {
        validate_name(&def.task)?;

        let mut tasks = self.tasks.write();
        if tasks.contains_key(&def.task) {
            return Err(Error::DuplicateTask(def.task));
        }

        let resolved = ReactiveTask {
            name: def.task.clone(),
            source_collection: def.collection,
            tasks_collection: def
                .tasks_collection
                .unwrap_or_else(|| config.collections.reactive_tasks.clone()),
            filter: def.filter,
            watch_projection: def.watch_projection,
            handler: def.handler,
            debounce: def.debounce.unwrap_or(config.debounce),
            retry_policy: def.retry_policy,
            evolution: def.evolution,
            cleanup_policy: def.cleanup_policy,
            execution_history_limit: def.execution_history_limit.max(1),
        };

        tasks.insert(def.task, Arc::new(resolved));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ReactiveTask>> {
        self.tasks.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ReactiveTask>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn for_source_collection(&self, collection: &str) -> Vec<Arc<ReactiveTask>> {
        self.tasks
            .read()
            .values()
            .filter(|task| task.source_collection == collection)
            .cloned()
            .collect()
    }

    pub fn for_tasks_collection(&self, collection: &str) -> Vec<Arc<ReactiveTask>> {
        self.tasks
            .read()
            .values()
            .filter(|task| task.tasks_collection == collection)
            .cloned()
            .collect()
    }

    /// Distinct work-item collections, i.e. the polling sources.
    pub fn tasks_collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self
            .tasks
            .read()
            .values()
            .map(|task| task.tasks_collection.clone())
            .collect();
        collections.sort_unstable();
        collections.dedup();
        collections
    }

    /// Distinct source collections the planner watches.
    pub fn source_collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self
            .tasks
            .read()
            .values()
            .map(|task| task.source_collection.clone())
            .collect();
        collections.sort_unstable();
        collections.dedup();
        collections
    }

    pub fn bindings(&self) -> Vec<TaskBinding> {
        self.tasks
            .read()
            .values()
            .map(|task| task.binding())
            .collect()
    }
}

/// Task names end up as map keys inside the meta document, so dotted or
/// dollar-prefixed names would corrupt partial updates.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidTaskName {
            name: name.to_owned(),
            reason: "name must not be empty",
        });
    }

    if name.contains('.') || name.starts_with('$') {
        return Err(Error::InvalidTaskName {
            name: name.to_owned(),
            reason: "name must not contain `.` or start with `$`",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ReactiveTaskDef {
        ReactiveTaskDef::new("greeter", "people", |_ctx| async { Ok(()) })
    }

    #[test]
    fn registration_resolves_defaults() {
        let config = SchedulerConfig::default();
        let registry = ReactiveRegistry::new();
        registry.register(noop(), &config).unwrap();

        let task = registry.get("greeter").unwrap();
        assert_eq!(task.tasks_collection, "reactiveTasks");
        assert_eq!(task.debounce, config.debounce);
        assert_eq!(registry.tasks_collections(), vec!["reactiveTasks"]);
        assert_eq!(registry.source_collections(), vec!["people"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let config = SchedulerConfig::default();
        let registry = ReactiveRegistry::new();
        registry.register(noop(), &config).unwrap();

        assert!(matches!(
            registry.register(noop(), &config),
            Err(Error::DuplicateTask(_))
        ));
    }

    #[test]
    fn dotted_names_are_rejected() {
        let config = SchedulerConfig::default();
        let registry = ReactiveRegistry::new();
        let def = ReactiveTaskDef::new("a.b", "people", |_ctx| async { Ok(()) });

        assert!(matches!(
            registry.register(def, &config),
            Err(Error::InvalidTaskName { .. })
        ));
    }
}
