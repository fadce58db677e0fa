#![allow(dead_code)]

use std::sync::Arc;

use autoflow::prelude::*;
use autoflow::{Device, EdgeKind, JobKind};

pub fn engine() -> Engine {
    Engine::new(Arc::new(Store::new()))
}

pub fn add_devices(engine: &Engine, names: &[&str]) -> Vec<Device> {
    names
        .iter()
        .map(|name| {
            engine
                .store()
                .add_device(Device::named(*name))
                .expect("Failed to add device")
        })
        .collect()
}

pub fn add_service(engine: &Engine, name: &str, handler: &str, devices: &[&Device]) -> Job {
    add_service_with(engine, name, handler, devices, |_| {})
}

pub fn add_service_with(
    engine: &Engine,
    name: &str,
    handler: &str,
    devices: &[&Device],
    configure: impl FnOnce(&mut Job),
) -> Job {
    let mut job = Job::service(name, handler);
    job.has_targets = !devices.is_empty();
    job.devices = devices.iter().map(|d| d.id).collect();
    job.retry_delay = 0;
    configure(&mut job);
    engine.store().add_job(job).expect("Failed to add service")
}

pub fn add_workflow(
    engine: &Engine,
    name: &str,
    members: &[&Job],
    configure: impl FnOnce(&mut Job),
) -> Job {
    let mut job = Job::workflow(name);
    if let JobKind::Workflow { jobs, .. } = &mut job.kind {
        *jobs = members.iter().map(|j| j.id).collect();
    }
    configure(&mut job);
    engine.store().add_job(job).expect("Failed to add workflow")
}

/// Toggle device propagation and traversal mode on a workflow job.
pub fn workflow_opts(job: &mut Job, use_devices: bool, mode: TraversalMode) {
    if let JobKind::Workflow {
        use_workflow_devices,
        traversal_mode,
        ..
    } = &mut job.kind
    {
        *use_workflow_devices = use_devices;
        *traversal_mode = mode;
    }
}

pub fn link(engine: &Engine, workflow: &Job, source: &Job, destination: &Job, kind: EdgeKind) {
    engine
        .store()
        .add_edge(Edge::new(workflow.id, source.id, destination.id, kind))
        .expect("Failed to add edge");
}

pub fn start_job(engine: &Engine) -> Job {
    engine.store().job_by_name("Start").unwrap()
}

pub fn end_job(engine: &Engine) -> Job {
    engine.store().job_by_name("End").unwrap()
}
