//! Expression evaluation for target, skip, and success queries.
//!
//! User expressions run in a restricted language with read-only access to
//! the payload, the device under execution, job metadata, and the current
//! invocation result:
//!
//! - dotted paths: `payload.targets`, `device.ip_address`, `job.name`,
//!   `result.success` (numeric segments index into arrays)
//! - literals: `'text'`, `"text"`, numbers, `true`, `false`
//! - comparisons: `==`, `!=`
//! - negation: `not <expr>`
//!
//! The built-in [`ExpressionEvaluator`] implements exactly this; richer
//! engines can be plugged in through the [`Evaluator`] trait. Evaluation
//! failures never abort a whole run: they surface as a failed result for
//! the node that used the expression.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::model::{Device, Job};

static COMPARISON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s*(==|!=)\s*(.+)$").unwrap());

/// Errors raised while evaluating a user expression.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Invalid expression syntax: {0}")]
    InvalidSyntax(String),

    #[error("Unsupported expression: {0}")]
    Unsupported(String),
}

/// Read-only context an expression is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub payload: Option<&'a Value>,
    pub device: Option<&'a Device>,
    pub job: Option<&'a Job>,
    pub result: Option<&'a Value>,
}

impl<'a> EvalContext<'a> {
    pub fn with_payload(payload: &'a Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn device(mut self, device: Option<&'a Device>) -> Self {
        self.device = device;
        self
    }

    pub fn job(mut self, job: &'a Job) -> Self {
        self.job = Some(job);
        self
    }

    pub fn result(mut self, result: &'a Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Pluggable expression engine.
pub trait Evaluator: Send + Sync {
    fn eval(&self, expr: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError>;
}

/// The built-in restricted expression language.
#[derive(Debug, Default)]
pub struct ExpressionEvaluator;

impl Evaluator for ExpressionEvaluator {
    fn eval(&self, expr: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(EvalError::InvalidSyntax("empty expression".into()));
        }

        if let Some(negated) = expr.strip_prefix("not ") {
            let value = self.eval(negated, ctx)?;
            return Ok(Value::Bool(!truthy(&value)));
        }

        if let Some(cap) = COMPARISON_REGEX.captures(expr) {
            let left = evaluate_operand(cap.get(1).unwrap().as_str().trim(), ctx)?;
            let right = evaluate_operand(cap.get(3).unwrap().as_str().trim(), ctx)?;
            let equal = left == right;
            return Ok(Value::Bool(match &cap[2] {
                "==" => equal,
                _ => !equal,
            }));
        }

        evaluate_operand(expr, ctx)
    }
}

fn evaluate_operand(operand: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    if let Some(literal) = parse_literal(operand) {
        return Ok(literal);
    }
    lookup_path(operand, ctx)
}

fn parse_literal(operand: &str) -> Option<Value> {
    if (operand.starts_with('\'') && operand.ends_with('\'') && operand.len() >= 2)
        || (operand.starts_with('"') && operand.ends_with('"') && operand.len() >= 2)
    {
        return Some(Value::String(operand[1..operand.len() - 1].to_string()));
    }
    match operand {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(n) = operand.parse::<i64>() {
        return Some(Value::from(n));
    }
    if let Ok(f) = operand.parse::<f64>() {
        return Some(Value::from(f));
    }
    None
}

fn lookup_path(path: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    let mut parts = path.split('.');
    let root = parts
        .next()
        .ok_or_else(|| EvalError::InvalidSyntax(path.to_string()))?;

    let mut current = match root {
        "payload" => ctx
            .payload
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable("payload".into()))?,
        "result" => ctx
            .result
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable("result".into()))?,
        "device" => {
            let device = ctx
                .device
                .ok_or_else(|| EvalError::UnknownVariable("device".into()))?;
            let key = parts
                .next()
                .ok_or_else(|| EvalError::InvalidSyntax(path.to_string()))?;
            device
                .property(key)
                .ok_or_else(|| EvalError::UnknownVariable(format!("device.{key}")))?
        }
        "job" => {
            let job = ctx
                .job
                .ok_or_else(|| EvalError::UnknownVariable("job".into()))?;
            let key = parts
                .next()
                .ok_or_else(|| EvalError::InvalidSyntax(path.to_string()))?;
            match key {
                "id" => Value::from(job.id),
                "name" => Value::from(job.name.clone()),
                "type" => Value::from(job.kind_name()),
                "creator" => Value::from(job.creator.clone()),
                _ => return Err(EvalError::UnknownVariable(format!("job.{key}"))),
            }
        }
        _ => return Err(EvalError::UnknownVariable(path.to_string())),
    };

    for part in parts {
        let next = match &current {
            Value::Object(map) => map.get(part).cloned(),
            Value::Array(items) => part
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned()),
            _ => None,
        };
        current = next.ok_or_else(|| EvalError::UnknownVariable(path.to_string()))?;
    }

    Ok(current)
}

/// Truthiness of an evaluated value: null, false, zero, and empty strings
/// are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        ExpressionEvaluator.eval(expr, ctx)
    }

    #[test]
    fn test_payload_path() {
        let payload = json!({ "facts": { "uptime": 42 } });
        let ctx = EvalContext::with_payload(&payload);
        assert_eq!(eval("payload.facts.uptime", &ctx).unwrap(), json!(42));
    }

    #[test]
    fn test_array_index() {
        let payload = json!({ "targets": ["r1", "r2"] });
        let ctx = EvalContext::with_payload(&payload);
        assert_eq!(eval("payload.targets.1", &ctx).unwrap(), json!("r2"));
    }

    #[test]
    fn test_device_attributes() {
        let mut device = Device::named("r1");
        device.vendor = "arista".into();
        let ctx = EvalContext::default().device(Some(&device));
        assert_eq!(eval("device.vendor", &ctx).unwrap(), json!("arista"));
        assert_eq!(
            eval("device.vendor == 'arista'", &ctx).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_comparison_and_negation() {
        let payload = json!({ "count": 3 });
        let ctx = EvalContext::with_payload(&payload);
        assert_eq!(eval("payload.count == 3", &ctx).unwrap(), json!(true));
        assert_eq!(eval("payload.count != 3", &ctx).unwrap(), json!(false));
        assert_eq!(eval("not payload.count", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_unknown_variable() {
        let payload = json!({});
        let ctx = EvalContext::with_payload(&payload);
        assert!(matches!(
            eval("payload.missing", &ctx),
            Err(EvalError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([1])));
        assert!(truthy(&json!("skipped")));
    }
}
