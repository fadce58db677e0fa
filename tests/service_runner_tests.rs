mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autoflow::prelude::*;
use autoflow::RunSpec;
use common::*;
use serde_json::{json, Value};

#[tokio::test]
async fn test_pure_service_without_targets() {
    let engine = engine();
    engine
        .handlers()
        .register_fn("ok", |_| Ok(json!({ "success": true, "result": "ok" })));
    let service = add_service(&engine, "probe", "ok", &[]);

    let report = engine.run(service.id, json!({})).await;

    assert!(report.success.passed());
    assert!(report.runtime.is_some());
    assert_eq!(report.results["success"], json!(true));
    assert_eq!(report.results["result"], json!("ok"));
    assert!(report.attempts.is_empty());
}

#[tokio::test]
async fn test_three_devices_one_persistent_failure() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2", "d3"]);
    engine.handlers().register_fn("flaky", |ctx| {
        let device = ctx.device.as_ref().unwrap();
        if device.name == "d2" {
            Ok(json!({ "success": false, "error": "unreachable" }))
        } else {
            Ok(json!({ "success": true }))
        }
    });
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service_with(&engine, "collect", "flaky", &refs, |job| {
        job.retries = 1;
    });

    let report = engine.run(service.id, json!({})).await;

    assert!(!report.success.truthy());
    assert_eq!(report.results["devices"]["d1"]["success"], json!(true));
    assert_eq!(report.results["devices"]["d2"]["success"], json!(false));
    assert_eq!(report.results["devices"]["d3"]["success"], json!(true));
    assert!(report.attempts.contains_key("Attempt 1"));
}

#[tokio::test]
async fn test_retry_recovers_failed_device() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2"]);
    let calls: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let handler_calls = Arc::clone(&calls);
    engine.handlers().register_fn("second-time-lucky", move |ctx| {
        let device = ctx.device.as_ref().unwrap();
        let mut calls = handler_calls.lock().unwrap();
        let count = calls.entry(device.name.clone()).or_insert(0);
        *count += 1;
        if device.name == "d2" && *count == 1 {
            Ok(json!({ "success": false, "error": "timeout" }))
        } else {
            Ok(json!({ "success": true }))
        }
    });
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service_with(&engine, "collect", "second-time-lucky", &refs, |job| {
        job.retries = 2;
    });

    let report = engine.run(service.id, json!({})).await;

    assert!(report.success.passed());
    assert_eq!(report.results["devices"]["d2"]["success"], json!(true));
    assert!(report.attempts.contains_key("Attempt 1"));

    // A device whose attempt succeeded is never retried.
    let calls = calls.lock().unwrap();
    assert_eq!(calls["d1"], 1);
    assert_eq!(calls["d2"], 2);
}

#[tokio::test]
async fn test_retry_ceiling_per_device() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1"]);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    engine.handlers().register_fn("down", move |_| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "success": false }))
    });
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service_with(&engine, "collect", "down", &refs, |job| {
        job.retries = 2;
    });

    let report = engine.run(service.id, json!({})).await;

    assert!(!report.success.truthy());
    // retries + 1 attempts, no more.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

struct GaugeHandler {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Handler for GaugeHandler {
    async fn invoke(&self, _ctx: &HandlerContext) -> anyhow::Result<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "success": true }))
    }
}

#[tokio::test]
async fn test_multiprocessing_worker_bound() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2", "d3", "d4", "d5"]);
    let gauge = Arc::new(GaugeHandler {
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    engine.handlers().register("gauge", gauge.clone());
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service_with(&engine, "collect", "gauge", &refs, |job| {
        if let JobKind::Service {
            multiprocessing,
            max_processes,
            ..
        } = &mut job.kind
        {
            *multiprocessing = true;
            *max_processes = 2;
        }
    });

    let report = engine.run(service.id, json!({})).await;

    assert!(report.success.passed());
    for name in ["d1", "d2", "d3", "d4", "d5"] {
        assert_eq!(report.results["devices"][name]["success"], json!(true));
    }
    let max = gauge.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 2, "observed {max} overlapping invocations");
    assert!(max >= 2, "fan-out never overlapped");
}

#[tokio::test]
async fn test_handler_panic_free_error_isolation() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2"]);
    engine.handlers().register_fn("brittle", |ctx| {
        let device = ctx.device.as_ref().unwrap();
        if device.name == "d1" {
            anyhow::bail!("connection refused");
        }
        Ok(json!({ "success": true }))
    });
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service(&engine, "collect", "brittle", &refs);

    let report = engine.run(service.id, json!({})).await;

    // The failing device is reified, the sibling is unaffected.
    assert!(!report.success.truthy());
    assert_eq!(report.results["devices"]["d1"]["success"], json!(false));
    assert!(report.results["devices"]["d1"]["error"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(report.results["devices"]["d2"]["success"], json!(true));
}

#[tokio::test]
async fn test_unknown_handler_is_reified() {
    let engine = engine();
    let service = add_service(&engine, "probe", "no-such-handler", &[]);

    let report = engine.run(service.id, json!({})).await;

    assert!(!report.success.truthy());
    assert!(report.results["error"]
        .as_str()
        .unwrap()
        .contains("no-such-handler"));
}

#[tokio::test]
async fn test_success_query_overrides_result() {
    let engine = engine();
    engine
        .handlers()
        .register_fn("status", |_| Ok(json!({ "success": true, "status": "down" })));
    let mut service = Job::service("probe", "status");
    service.success_query = Some("result.status == 'up'".into());
    let service = engine.store().add_job(service).unwrap();

    let report = engine.run(service.id, json!({})).await;

    assert!(!report.success.truthy());
    assert_eq!(report.results["status"], json!("down"));
}

#[tokio::test]
async fn test_resolution_error_aborts_run() {
    let engine = engine();
    let mut service = Job::service("probe", "job1");
    service.has_targets = true;
    service.target_query = Some("payload.targets".into());
    service.query_property_type = TargetProperty::Name;
    let service = engine.store().add_job(service).unwrap();

    let report = engine
        .run(service.id, json!({ "targets": ["ghost"] }))
        .await;

    assert!(!report.success.truthy());
    assert!(report.error.unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_target_query_resolves_devices() {
    let engine = engine();
    add_devices(&engine, &["d1", "d2", "d3"]);
    engine.handlers().register_fn("touch", |_| Ok(json!({ "success": true })));
    let mut service = Job::service("probe", "touch");
    service.has_targets = true;
    service.target_query = Some("payload.targets".into());
    service.query_property_type = TargetProperty::Name;
    let service = engine.store().add_job(service).unwrap();

    let report = engine
        .run(service.id, json!({ "targets": ["d1", "d3"] }))
        .await;

    assert!(report.success.passed());
    let devices = report.results["devices"].as_object().unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.contains_key("d1"));
    assert!(devices.contains_key("d3"));
}

#[tokio::test]
async fn test_explicit_device_properties_override() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2"]);
    engine.handlers().register_fn("touch", |_| Ok(json!({ "success": true })));
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service(&engine, "probe", "touch", &refs);

    let mut spec = RunSpec::new(service.id);
    spec.properties.devices = Some(vec![devices[1].id]);
    let run = engine.store().create_run(spec).unwrap();
    let report = engine.execute(run, json!({})).await;

    let result_devices = report.results["devices"].as_object().unwrap();
    assert_eq!(result_devices.len(), 1);
    assert!(result_devices.contains_key("d2"));
}

#[tokio::test]
async fn test_cancellation_between_attempts() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1"]);
    let run = {
        let mut service = Job::service("probe", "tripwire");
        service.has_targets = true;
        service.devices = vec![devices[0].id];
        service.retries = 5;
        service.retry_delay = 0;
        let service = engine.store().add_job(service).unwrap();
        engine.store().create_run(RunSpec::new(service.id)).unwrap()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let stopper = engine.clone();
    let runtime = run.runtime.clone();
    engine.handlers().register_fn("tripwire", move |_| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        // Cancel from inside the first attempt; later attempts must not run.
        assert!(stopper.stop(&runtime));
        Ok(json!({ "success": false }))
    });

    let report = engine.execute(run, json!({})).await;

    assert!(!report.success.truthy());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_per_device_results_recorded() {
    let engine = engine();
    let devices = add_devices(&engine, &["d1", "d2"]);
    engine.handlers().register_fn("touch", |_| Ok(json!({ "success": true })));
    let refs: Vec<_> = devices.iter().collect();
    let service = add_service(&engine, "probe", "touch", &refs);

    engine.run(service.id, json!({})).await;

    for device in &devices {
        assert_eq!(engine.results().for_device(device.id).len(), 1);
    }
    // Plus the run-level record.
    assert_eq!(engine.results().for_job(service.id).len(), 3);
}
