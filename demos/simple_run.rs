//! Simple service run example
//!
//! Run with: cargo run --example simple_run

use std::sync::Arc;

use autoflow::prelude::*;
use serde_json::json;

const TOPOLOGY: &str = r#"
devices:
  - name: edge-1
    ip_address: 10.0.0.1
    vendor: arista
  - name: edge-2
    ip_address: 10.0.0.2
    vendor: cisco
services:
  - name: get-facts
    handler: job1
    has_targets: true
    devices: [edge-1, edge-2]
    retries: 1
    retry_delay: 0
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("autoflow=debug")
        .init();

    let store = Arc::new(Store::new());
    TopologyLoader::load_str(TOPOLOGY, &store)?;

    let engine = Engine::new(store);

    println!("Starting run...");
    let report = engine.run_by_name("get-facts", json!({})).await;

    println!("\n=== Run Results ===");
    println!("Runtime: {}", report.runtime.as_deref().unwrap_or("-"));
    println!("Success: {:?}", report.success);
    if let Some(devices) = report.results["devices"].as_object() {
        for (device, result) in devices {
            println!("  {} -> {}", device, result["success"]);
        }
    }

    Ok(())
}
