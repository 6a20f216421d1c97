//! Handler registry.
//!
//! Maps job type strings (e.g. "course_build") to the handlers that
//! execute them. Domains register their handlers at process init; lookups
//! are read-only and concurrent from every worker task.
//!
//! Handlers must tolerate re-runs after a crash or lease loss: each stage
//! should check persisted state and skip work already done.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::context::JobContext;

/// A pluggable executor for a single job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type string this handler owns.
    fn job_type(&self) -> &'static str;

    /// Execute one attempt. Returning `Ok(())` without a terminal call on
    /// the context counts as success; the dispatcher closes the run.
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

type BoxedRun = Box<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Adapter turning a plain async closure into a [`JobHandler`].
struct FnJobHandler {
    job_type: &'static str,
    run: BoxedRun,
}

#[async_trait]
impl JobHandler for FnJobHandler {
    fn job_type(&self) -> &'static str {
        self.job_type
    }

    async fn run(&self, ctx: JobContext) -> Result<()> {
        (self.run)(ctx).await
    }
}

/// Registry that maps job type strings to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register(Arc::new(CourseBuildHandler::new(deps)));
/// registry.register_fn("demo", |ctx| async move {
///     ctx.succeed("done", serde_json::json!({"ok": true})).await
/// });
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own job type. Re-registering a type
    /// replaces the previous handler (last registration wins).
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    /// Register an async closure as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: &'static str, run: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedRun = Box::new(move |ctx| Box::pin(run(ctx)));
        self.register(Arc::new(FnJobHandler {
            job_type,
            run: boxed,
        }));
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get all registered job types.
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.keys().map(|t| t.to_string()).collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register_fn("demo", |_ctx| async move { Ok(()) });

        assert!(registry.is_registered("demo"));
        assert!(!registry.is_registered("unknown"));
        assert!(registry.get("demo").is_some());
    }

    #[test]
    fn registered_types_lists_every_type() {
        let mut registry = JobRegistry::new();
        registry.register_fn("demo", |_ctx| async move { Ok(()) });
        registry.register_fn("course_build", |_ctx| async move { Ok(()) });

        let mut types = registry.registered_types();
        types.sort();
        assert_eq!(types, vec!["course_build", "demo"]);
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = JobRegistry::new();
        registry.register_fn("demo", |_ctx| async move { Ok(()) });
        registry.register_fn("demo", |_ctx| async move { anyhow::bail!("second") });

        assert_eq!(registry.registered_types().len(), 1);
    }
}
