//! Workflow with per-device membership propagation
//!
//! Devices that pass a node flow along its success edges, devices that
//! fail flow along its failure edges, and the run succeeds only when every
//! initial device reaches End.
//!
//! Run with: cargo run --example device_workflow

use std::sync::Arc;

use autoflow::prelude::*;
use serde_json::json;

const TOPOLOGY: &str = r#"
devices:
  - name: edge-1
    ip_address: 10.0.0.1
  - name: edge-2
    ip_address: 10.0.0.2
services:
  - name: check-reachability
    handler: probe
    has_targets: true
  - name: upgrade
    handler: job1
    has_targets: true
  - name: report-unreachable
    handler: notify_mail
    mail_recipient: ops@example.com
workflows:
  - name: maintenance
    devices: [edge-1, edge-2]
    jobs: [check-reachability, upgrade, report-unreachable]
    edges:
      - source: Start
        destination: check-reachability
        kind: success
      - source: check-reachability
        destination: upgrade
        kind: success
      - source: check-reachability
        destination: report-unreachable
        kind: failure
      - source: upgrade
        destination: End
        kind: success
      - source: report-unreachable
        destination: End
        kind: success
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("autoflow=info")
        .init();

    let store = Arc::new(Store::new());
    TopologyLoader::load_str(TOPOLOGY, &store)?;

    let engine = Engine::new(store);
    engine.handlers().register_fn("probe", |ctx| {
        let device = ctx.device.as_ref().expect("probe is device-scoped");
        // Pretend edge-2 is unreachable.
        Ok(json!({ "success": device.name != "edge-2" }))
    });

    let report = engine.run_by_name("maintenance", json!({})).await;

    println!("\n=== Workflow Results ===");
    println!("Success: {:?}", report.success);
    if let Some(devices) = &report.devices {
        for (device, summary) in devices {
            let status = if summary.success { "✓" } else { "✗" };
            println!("  [{}] {}", status, device);
        }
    }

    Ok(())
}
