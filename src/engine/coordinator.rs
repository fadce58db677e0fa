//! The engine entry point.
//!
//! [`Engine`] bundles the entity store, result store, run-state map,
//! handler registry, evaluator, notifier, and exporter, and exposes the
//! synchronous-looking `run(job, payload)` call. Internally it dispatches
//! to the service runner or the workflow traverser by job type, and
//! recursively executes child runs for nested jobs.
//!
//! No failure escapes a top-level run: everything is reified into the
//! result envelope.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::engine::report::Report;
use crate::eval::{Evaluator, ExpressionEvaluator};
use crate::export::GitExporter;
use crate::handlers::HandlerRegistry;
use crate::model::{Job, JobId, JobKind, Run, RunSpec};
use crate::notify::{LogNotifier, Notifier};
use crate::store::{ResultStore, RunStateMap, Store};

/// The workflow engine. Cheap to clone; all components are shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<Store>,
    pub(crate) results: Arc<ResultStore>,
    pub(crate) state: Arc<RunStateMap>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) exporter: Option<Arc<GitExporter>>,
}

impl Engine {
    /// An engine over the given store, with the built-in handler registry,
    /// expression evaluator, and log notifier.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            results: Arc::new(ResultStore::new()),
            state: Arc::new(RunStateMap::new()),
            handlers: Arc::new(HandlerRegistry::with_builtins()),
            evaluator: Arc::new(ExpressionEvaluator),
            notifier: Arc::new(LogNotifier),
            exporter: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_exporter(mut self, exporter: GitExporter) -> Self {
        self.exporter = Some(Arc::new(exporter));
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    pub fn state(&self) -> &Arc<RunStateMap> {
        &self.state
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Run a job by id against a payload and wait for the sealed result.
    pub async fn run(&self, job: JobId, payload: Value) -> Report {
        match self.store.create_run(RunSpec::new(job)) {
            Ok(run) => self.execute(run, payload).await,
            Err(error) => Report::failed(error),
        }
    }

    pub async fn run_by_name(&self, name: &str, payload: Value) -> Report {
        match self.store.job_by_name(name) {
            Ok(job) => self.run(job.id, payload).await,
            Err(error) => Report::failed(error),
        }
    }

    /// Execute an already-created run record at top level: seed the
    /// payload, dispatch, stamp the runtime, then seal the run and fire
    /// the best-effort export and notification hooks.
    #[instrument(skip(self, run, payload), fields(runtime = %run.runtime))]
    pub async fn execute(&self, run: Run, payload: Value) -> Report {
        let job = match self.store.job(run.job) {
            Ok(job) => job,
            Err(error) => return Report::failed(error),
        };
        self.state.job_started(job.id);
        let payload = seed_payload(&job, payload);

        let mut report = self.execute_run(&run, &payload).await;
        report.runtime = Some(run.runtime.clone());

        self.state.job_finished(job.id);
        self.store.remove_run(&run.runtime);

        if job.push_to_git {
            if let Some(exporter) = &self.exporter {
                let text = serde_json::to_string_pretty(&report.to_value())
                    .unwrap_or_else(|_| String::new());
                exporter.push_results(&job.filename(), &text).await;
            }
        }
        if job.send_notification {
            if let Err(error) = self
                .notifier
                .notify(
                    job.notification_method,
                    &job.notification_header,
                    &report,
                    &job.recipients(),
                )
                .await
            {
                warn!(job = %job.name, %error, "notification failed");
            }
        }
        report
    }

    /// Request cancellation of an active run. Cooperative and idempotent:
    /// the flag is observed between workflow nodes and service attempts.
    pub fn stop(&self, runtime: &str) -> bool {
        self.store.stop_run(runtime)
    }

    /// Execute one run record, dispatching by job type. Used for both
    /// top-level runs and the child runs the traverser creates; boxed so
    /// nested workflows can recurse.
    pub(crate) fn execute_run<'a>(
        &'a self,
        run: &'a Run,
        payload: &'a Value,
    ) -> BoxFuture<'a, Report> {
        async move {
            self.state.init(&run.runtime);
            let job = match self.store.job(run.job) {
                Ok(job) => job,
                Err(error) => return Report::failed(error),
            };
            info!(job = %job.name, runtime = %run.runtime, "starting {} run", job.kind_name());
            let report = match &job.kind {
                JobKind::Service { .. } => self.run_service(run, &job, payload).await,
                JobKind::Workflow { .. } => self.run_workflow(run, &job, payload).await,
            };
            self.results.record(run, None, &report.to_value());
            info!(
                job = %job.name,
                runtime = %run.runtime,
                success = ?report.success,
                "run finished"
            );
            report
        }
        .boxed()
    }
}

/// Merge the caller's payload over the job's initial payload.
fn seed_payload(job: &Job, payload: Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut base = job.initial_payload.clone();
            base.extend(map);
            Value::Object(base)
        }
        Value::Null => Value::Object(job.initial_payload.clone()),
        other => other,
    }
}
