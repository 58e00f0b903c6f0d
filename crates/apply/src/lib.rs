//! fleetsync apply: rendered-manifest parsing, decision execution and the
//! direct-API backend ([`KubeTransport`]).

#![forbid(unsafe_code)]

mod direct;

use std::time::{Duration, Instant};

use fleetsync_core::{describe, ApplyDecision, ApplyResult, Error, Operation, RequestContext, Result};
use fleetsync_kubehub::ResourceClient;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

pub use direct::KubeTransport;

const DEFAULT_MAX_BYTES: usize = 1 << 20; // 1 MiB
const DEFAULT_MAX_NODES: usize = 100_000;

/// Limits and timings shared by both backends.
#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub max_manifest_bytes: usize,
    pub max_manifest_nodes: usize,
    /// How long a recreate waits for the old object to disappear.
    pub recreate_timeout: Duration,
    pub recreate_poll: Duration,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            max_manifest_bytes: DEFAULT_MAX_BYTES,
            max_manifest_nodes: DEFAULT_MAX_NODES,
            recreate_timeout: Duration::from_secs(30),
            recreate_poll: Duration::from_millis(200),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl ApplySettings {
    /// Defaults overridden by `FLEETSYNC_MAX_MANIFEST_BYTES`,
    /// `FLEETSYNC_MAX_MANIFEST_NODES` and `FLEETSYNC_RECREATE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_manifest_bytes: env_parse("FLEETSYNC_MAX_MANIFEST_BYTES").unwrap_or(d.max_manifest_bytes),
            max_manifest_nodes: env_parse("FLEETSYNC_MAX_MANIFEST_NODES").unwrap_or(d.max_manifest_nodes),
            recreate_timeout: env_parse("FLEETSYNC_RECREATE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.recreate_timeout),
            recreate_poll: d.recreate_poll,
        }
    }
}

/// True when `v` has more than `max` nodes. Counting stops one past the limit.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for child in map.values() {
                    if *cur > max { break; }
                    walk(child, cur, max);
                }
            }
            Json::Array(arr) => {
                for child in arr {
                    if *cur > max { break; }
                    walk(child, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Parse rendered bytes (YAML or JSON) into a dynamic object, enforcing the
/// payload guards and requiring apiVersion, kind and metadata.name.
pub fn parse_manifest(bytes: &[u8], settings: &ApplySettings) -> Result<DynamicObject> {
    const CTX: &str = "rendered manifest";
    if bytes.len() > settings.max_manifest_bytes {
        return Err(Error::structural(CTX, None, format!("payload too large (>{} bytes)", settings.max_manifest_bytes)));
    }
    let text = std::str::from_utf8(bytes).map_err(|e| Error::structural(CTX, None, e))?;
    let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| Error::structural(CTX, None, e))?;
    let json = serde_json::to_value(val).map_err(|e| Error::structural(CTX, None, e))?;
    if !json.is_object() {
        return Err(Error::structural(CTX, None, "document is not an object"));
    }
    if json_node_budget_exceeded(&json, settings.max_manifest_nodes) {
        return Err(Error::structural(CTX, None, format!("document too complex (>{} nodes)", settings.max_manifest_nodes)));
    }
    let present = |v: Option<&Json>| v.and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
    if !present(json.get("apiVersion")) {
        return Err(Error::structural(CTX, None, "missing apiVersion"));
    }
    if !present(json.get("kind")) {
        return Err(Error::structural(CTX, None, "missing kind"));
    }
    if !present(json.get("metadata").and_then(|m| m.get("name"))) {
        return Err(Error::structural(CTX, None, "missing metadata.name"));
    }
    serde_json::from_value(json).map_err(|e| Error::structural(CTX, None, e))
}

/// Execute a decision against `client`. `Skip` makes no backend call;
/// `Recreate` deletes, waits for the object to disappear, then creates.
pub async fn execute_decision(
    client: &dyn ResourceClient,
    ctx: &RequestContext,
    gvk: &GroupVersionKind,
    mut desired: DynamicObject,
    existing: Option<DynamicObject>,
    decision: &ApplyDecision,
    settings: &ApplySettings,
) -> Result<()> {
    let namespace = desired.metadata.namespace.clone();
    let name = desired.name_any();
    match decision.operation {
        Operation::Skip => {
            debug!(resource = %describe(&desired), reason = %decision.reason, "skip");
            return Ok(());
        }
        Operation::Create => {
            desired.metadata.resource_version = None;
            ctx.run(client.create(gvk, &desired)).await?;
        }
        Operation::Update => {
            desired.metadata.resource_version = existing.and_then(|e| e.metadata.resource_version);
            ctx.run(client.replace(gvk, &desired)).await?;
        }
        Operation::Recreate => {
            ctx.run(client.delete(gvk, namespace.as_deref(), &name)).await?;
            wait_until_deleted(client, ctx, gvk, namespace.as_deref(), &name, settings).await?;
            desired.metadata.resource_version = None;
            ctx.run(client.create(gvk, &desired)).await?;
        }
    }
    info!(
        resource = %describe(&desired),
        operation = %decision.operation,
        generation = decision.new_generation,
        "applied"
    );
    Ok(())
}

async fn wait_until_deleted(
    client: &dyn ResourceClient,
    ctx: &RequestContext,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
    settings: &ApplySettings,
) -> Result<()> {
    let started = Instant::now();
    loop {
        if ctx.run(client.get_opt(gvk, namespace, name)).await?.is_none() {
            return Ok(());
        }
        if started.elapsed() >= settings.recreate_timeout {
            return Err(Error::transport(format!(
                "{} {} still present {:?} after delete",
                gvk.kind, name, settings.recreate_timeout
            )));
        }
        ctx.run(async {
            tokio::time::sleep(settings.recreate_poll).await;
            Ok(())
        })
        .await?;
    }
}

fn error_class(e: &Error) -> &'static str {
    match e {
        Error::NotFound { .. } => "not_found",
        Error::InvalidGeneration { .. } => "invalid_generation",
        Error::StructuralParse { .. } => "structural",
        Error::Cancelled => "cancelled",
        Error::MissingRouting(_) => "missing_routing",
        _ => "transport",
    }
}

/// Count an apply attempt and, when it succeeded, its latency.
pub fn record_apply(backend: &'static str, outcome: &Result<ApplyResult>, started: Instant) {
    match outcome {
        Ok(res) => {
            counter!("fleetsync_apply_total", 1u64, "backend" => backend, "operation" => res.operation.as_str());
            histogram!("fleetsync_apply_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "backend" => backend);
        }
        Err(e) => {
            counter!("fleetsync_apply_errors_total", 1u64, "backend" => backend, "error" => error_class(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_yaml_and_json() {
        let y = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n  namespace: ns\ndata:\n  k: v\n";
        let o = parse_manifest(y, &ApplySettings::default()).unwrap();
        assert_eq!(o.name_any(), "x");
        assert_eq!(o.metadata.namespace.as_deref(), Some("ns"));

        let j = br#"{"apiVersion":"apps/v1","kind":"Deployment","metadata":{"name":"d"}}"#;
        let o = parse_manifest(j, &ApplySettings::default()).unwrap();
        assert_eq!(fleetsync_core::object_kind(&o), "Deployment");
    }

    #[test]
    fn parse_errors_are_structural_and_friendly() {
        let s = ApplySettings::default();
        let cases: [(&[u8], &str); 5] = [
            (b"kind: Foo\nmetadata:\n  name: x\n", "missing apiVersion"),
            (b"apiVersion: v1\nmetadata:\n  name: x\n", "missing kind"),
            (b"apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", "missing metadata.name"),
            (b"- a\n- b\n", "not an object"),
            (b"apiVersion: [unterminated\n", "rendered manifest"),
        ];
        for (input, want) in cases {
            let err = parse_manifest(input, &s).unwrap_err();
            assert!(matches!(err, Error::StructuralParse { .. }), "{}", err);
            assert!(err.to_string().contains(want), "err={} want={}", err, want);
        }
    }

    #[test]
    fn payload_guards_apply() {
        let small = ApplySettings { max_manifest_bytes: 10, ..Default::default() };
        let err = parse_manifest(b"apiVersion: v1\nkind: ConfigMap\n", &small).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);

        let shallow = ApplySettings { max_manifest_nodes: 4, ..Default::default() };
        let err = parse_manifest(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\ndata:\n  a: b\n", &shallow).unwrap_err();
        assert!(err.to_string().contains("too complex"), "{}", err);
    }

    #[test]
    fn error_classes_are_stable_labels() {
        assert_eq!(error_class(&Error::Cancelled), "cancelled");
        assert_eq!(error_class(&Error::transport("boom")), "transport");
        assert_eq!(error_class(&Error::not_found("ConfigMap", None, "x")), "not_found");
    }

    #[test]
    fn node_budget_counts_nested_values() {
        // root, array, 1, 2, object, 3
        let v = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(!json_node_budget_exceeded(&v, 6));
        assert!(json_node_budget_exceeded(&v, 5));
        assert!(json_node_budget_exceeded(&v, 3));
    }

    #[test]
    fn node_limit_is_inclusive() {
        // root, apiVersion, kind, metadata, name
        let doc = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        let at_limit = ApplySettings { max_manifest_nodes: 5, ..Default::default() };
        assert!(parse_manifest(doc, &at_limit).is_ok());
        let below = ApplySettings { max_manifest_nodes: 4, ..Default::default() };
        assert!(parse_manifest(doc, &below).is_err());
    }

    #[test]
    fn default_byte_limit_is_one_mebibyte() {
        assert_eq!(ApplySettings::default().max_manifest_bytes, 1_048_576);
    }
}
