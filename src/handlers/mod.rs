//! Service handlers and the process-wide handler registry.
//!
//! A service names a handler; the registry maps that name to an
//! implementation. Registration is a pure data operation, so embedding
//! applications extend the registry with their own handlers (or plain
//! closures) before running jobs.

mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{Device, JobSnapshot};

/// Everything a handler may read during one invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job: JobSnapshot,
    /// The device this invocation is scoped to, if the service has targets.
    pub device: Option<Device>,
    pub payload: Value,
    pub recipients: Vec<String>,
}

/// A unit of work invoked by the service runner.
///
/// Errors are reified into `{success: false, error}` results for the
/// invocation's scope (one device, or the whole run when target-less); they
/// never abort sibling devices.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, ctx: &HandlerContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&HandlerContext) -> anyhow::Result<Value> + Send + Sync,
{
    async fn invoke(&self, ctx: &HandlerContext) -> anyhow::Result<Value> {
        (self.0)(ctx)
    }
}

/// Name-keyed handler registry.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with `Start`, `End`, and the swiss-army
    /// handler family.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register(&registry);
        registry
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.inner.write().unwrap().insert(name.into(), handler);
    }

    /// Register a synchronous closure as a handler.
    pub fn register_fn<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&HandlerContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnHandler(handler)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_registration() {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |ctx| Ok(json!({ "success": true, "job": ctx.job.name })));

        let ctx = HandlerContext {
            job: crate::model::Job::service("probe", "echo").snapshot(),
            device: None,
            payload: json!({}),
            recipients: vec![],
        };
        let result = registry.get("echo").unwrap().invoke(&ctx).await.unwrap();
        assert_eq!(result["job"], json!("probe"));
    }

    #[test]
    fn test_builtins_present() {
        let registry = HandlerRegistry::with_builtins();
        for name in ["Start", "End", "job1", "job2", "process_payload1"] {
            assert!(registry.get(name).is_some(), "missing builtin {name}");
        }
    }
}
