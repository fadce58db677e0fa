//! Built-in handlers: workflow anchors and the swiss-army family.

use anyhow::{anyhow, Context as _};
use serde_json::{json, Value};
use tracing::info;

use super::{HandlerContext, HandlerRegistry};

pub(super) fn register(registry: &HandlerRegistry) {
    // Workflow anchors. Every workflow contains both.
    registry.register_fn("Start", |_| Ok(json!({ "success": true })));
    registry.register_fn("End", |_| Ok(json!({ "success": true })));

    // Device-scoped and global no-op work units.
    registry.register_fn("job1", |_| Ok(json!({ "success": true, "result": "" })));
    registry.register_fn("job2", |_| Ok(json!({ "success": true, "result": "" })));

    registry.register_fn("notify_mail", notify("mail"));
    registry.register_fn("notify_slack", notify("slack"));
    registry.register_fn("notify_mattermost", notify("mattermost"));

    registry.register_fn("process_payload1", process_payload1);
}

fn notify(
    transport: &'static str,
) -> impl Fn(&HandlerContext) -> anyhow::Result<Value> + Send + Sync + 'static {
    move |ctx| {
        info!(
            transport,
            job = ctx.job.name.as_str(),
            recipients = ctx.recipients.join(",").as_str(),
            "sending feedback notification"
        );
        Ok(json!({ "success": true }))
    }
}

/// Derive a per-device verdict from a previous node's facts. The device's
/// entry is looked up by name inside the `get_facts` node result.
fn process_payload1(ctx: &HandlerContext) -> anyhow::Result<Value> {
    let device = ctx
        .device
        .as_ref()
        .ok_or_else(|| anyhow!("process_payload1 requires a device"))?;
    let uptime = ctx
        .payload
        .pointer(&format!(
            "/get_facts/results/devices/{}/result/get_facts/uptime",
            device.name
        ))
        .and_then(Value::as_f64)
        .with_context(|| format!("no get_facts uptime for device {}", device.name))?;
    Ok(json!({
        "success": true,
        "result": { "uptime_below_threshold": uptime < 50_000.0 }
    }))
}
