//! The service runner.
//!
//! One service invocation fans out across its target set, optionally in
//! parallel, and is retried up to the configured bound. Devices that
//! succeed are never re-run within the same run; their results accumulate
//! under `results.devices` while failed devices carry over to the next
//! attempt. Without targets the service runs once per attempt and the
//! first successful attempt wins.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::engine::coordinator::Engine;
use crate::engine::report::{value_success, Outcome, Report};
use crate::eval::{truthy, EvalContext};
use crate::handlers::HandlerContext;
use crate::model::{Device, Job, JobKind, Run};

impl Engine {
    /// Execute one service run: resolve targets, then attempt until every
    /// device succeeded or the retry bound is exhausted.
    pub(crate) async fn run_service(&self, run: &Run, job: &Job, payload: &Value) -> Report {
        let mut report = Report::new(&run.runtime);
        let mut remaining: Vec<Device> = Vec::new();
        if run.has_targets {
            match self.compute_targets(run, payload) {
                Ok(targets) => {
                    remaining = targets;
                    report.results = json!({ "devices": {} });
                }
                Err(error) => return Report::failed(error),
            }
        }
        let fanout = !remaining.is_empty();
        let retries = run.retries;

        for attempt in 0..=retries {
            if run.is_stopped() {
                info!(job = %job.name, runtime = %run.runtime, "run cancelled between attempts");
                return report;
            }
            info!(
                job = %job.name,
                runtime = %run.runtime,
                "running service (attempt {})",
                attempt + 1
            );
            self.state.reset_progress(&run.runtime);
            let outcome = self.service_attempt(run, job, payload, &remaining).await;

            if fanout {
                let devices = outcome
                    .get("devices")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                remaining.retain(|device| match devices.get(&device.name) {
                    Some(result) if value_success(result) => {
                        report.results["devices"][device.name.as_str()] = result.clone();
                        false
                    }
                    _ => true,
                });
                if remaining.is_empty() {
                    report.success = Outcome::Passed;
                    break;
                }
                if attempt != retries {
                    if retries > 0 {
                        report
                            .attempts
                            .insert(format!("Attempt {}", attempt + 1), outcome);
                    }
                    sleep(Duration::from_secs(run.retry_delay)).await;
                } else {
                    for device in &remaining {
                        if let Some(result) = devices.get(&device.name) {
                            report.results["devices"][device.name.as_str()] = result.clone();
                        }
                    }
                }
            } else {
                let success = value_success(&outcome);
                if success || attempt == retries {
                    report.success = Outcome::from_bool(success);
                    report.results = outcome;
                    break;
                }
                if retries > 0 {
                    report
                        .attempts
                        .insert(format!("Attempt {}", attempt + 1), outcome);
                }
                sleep(Duration::from_secs(run.retry_delay)).await;
            }
        }
        report
    }

    /// One attempt: a single global invocation, or one invocation per
    /// target, serialized into a `devices` map. With multiprocessing the
    /// per-device invocations run on up to `max_processes` workers; the
    /// shared map write is the only cross-worker mutation.
    async fn service_attempt(
        &self,
        run: &Run,
        job: &Job,
        payload: &Value,
        targets: &[Device],
    ) -> Value {
        if targets.is_empty() {
            return self.invoke_handler(run, job, payload, None).await;
        }

        let results: Map<String, Value> = if run.multiprocessing {
            let workers = targets.len().min(run.max_processes);
            let semaphore = Arc::new(Semaphore::new(workers));
            let shared = Arc::new(Mutex::new(Map::new()));
            let mut handles = Vec::with_capacity(targets.len());
            for device in targets.iter().cloned() {
                let engine = self.clone();
                let run = run.clone();
                let job = job.clone();
                let payload = payload.clone();
                let semaphore = Arc::clone(&semaphore);
                let shared = Arc::clone(&shared);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.unwrap();
                    let result = engine.invoke_handler(&run, &job, &payload, Some(&device)).await;
                    shared.lock().await.insert(device.name.clone(), result);
                }));
            }
            join_all(handles).await;
            let results = shared.lock().await.clone();
            results
        } else {
            let mut results = Map::new();
            for device in targets {
                let result = self.invoke_handler(run, job, payload, Some(device)).await;
                results.insert(device.name.clone(), result);
            }
            results
        };

        for device in targets {
            if let Some(result) = results.get(&device.name) {
                self.results.record(run, Some(device.id), result);
            }
        }
        json!({ "devices": results })
    }

    /// Invoke the service's handler once and normalize the result: stamp
    /// the invocation runtime, default a missing success flag, reify
    /// handler errors, apply the job's success query, and bump the
    /// progress counters.
    pub(crate) async fn invoke_handler(
        &self,
        run: &Run,
        job: &Job,
        payload: &Value,
        device: Option<&Device>,
    ) -> Value {
        let handler_name = match &job.kind {
            JobKind::Service { handler, .. } => handler.clone(),
            JobKind::Workflow { .. } => {
                return json!({ "success": false, "error": "workflows have no handler" });
            }
        };
        debug!(
            job = %job.name,
            device = device.map(|d| d.name.as_str()).unwrap_or("-"),
            handler = %handler_name,
            "invoking handler"
        );

        let mut result = Map::new();
        result.insert(
            "runtime".into(),
            Value::from(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        );
        match self.handlers.get(&handler_name) {
            None => {
                result.insert("success".into(), Value::Bool(false));
                result.insert(
                    "error".into(),
                    Value::from(format!("Unknown handler: {handler_name}")),
                );
            }
            Some(handler) => {
                let ctx = HandlerContext {
                    job: job.snapshot(),
                    device: device.cloned(),
                    payload: payload.clone(),
                    recipients: job.recipients(),
                };
                match handler.invoke(&ctx).await {
                    Ok(Value::Object(map)) => {
                        result.extend(map);
                        result
                            .entry("success".to_string())
                            .or_insert(Value::Bool(true));
                    }
                    Ok(other) => {
                        result.insert("result".into(), other);
                        result.insert("success".into(), Value::Bool(true));
                    }
                    Err(error) => {
                        result.insert("success".into(), Value::Bool(false));
                        result.insert("error".into(), Value::from(format!("{error:#}")));
                    }
                }
            }
        }

        if let Some(query) = &job.success_query {
            let snapshot = Value::Object(result.clone());
            let ctx = EvalContext::with_payload(payload)
                .device(device)
                .job(job)
                .result(&snapshot);
            match self.evaluator.eval(query, &ctx) {
                Ok(value) => {
                    result.insert("success".into(), Value::Bool(truthy(&value)));
                }
                Err(error) => {
                    result.insert("success".into(), Value::Bool(false));
                    result.insert("error".into(), Value::from(error.to_string()));
                }
            }
        }

        let value = Value::Object(result);
        if value_success(&value) {
            self.state.record_completed(&run.runtime);
        } else {
            self.state.record_failed(&run.runtime);
        }
        value
    }
}
