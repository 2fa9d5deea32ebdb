//! Parsing of the manifest stream into apply targets.

use kube::core::GroupVersionKind;
use pilot_core::{config::Settings, manifest::split_manifests, PilotError, Result};
use pilot_kubehub::gvk_from_object;
use serde_json::Value as Json;

/// Size guards for one apply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl From<&Settings> for Limits {
    fn from(s: &Settings) -> Self { Self { max_bytes: s.max_manifest_bytes, max_nodes: s.max_manifest_nodes } }
}

impl Default for Limits {
    fn default() -> Self { Limits::from(&Settings::default()) }
}

/// One object to apply.
#[derive(Debug, Clone)]
pub(crate) struct Manifest {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
    pub body: Json,
}

pub(crate) fn parse_manifests(data: &[u8], limits: &Limits) -> Result<Vec<Manifest>> {
    if data.len() > limits.max_bytes {
        return Err(PilotError::InvalidRequest(format!("manifest payload too large (>{} bytes)", limits.max_bytes)));
    }
    let mut out = Vec::new();
    for (index, doc) in split_manifests(data).iter().enumerate() {
        let invalid = |reason: String| PilotError::InvalidManifest { index, reason };
        let val: serde_yaml::Value = serde_yaml::from_slice(doc).map_err(|e| invalid(format!("parsing YAML: {}", e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| invalid(format!("converting YAML to JSON: {}", e)))?;
        if json_node_budget_exceeded(&json, limits.max_nodes) {
            return Err(invalid(format!("document too complex (>{} nodes)", limits.max_nodes)));
        }
        match list_items(&json) {
            Some(items) => {
                for item in items {
                    out.push(target(item.clone()).map_err(invalid)?);
                }
            }
            None => out.push(target(json).map_err(invalid)?),
        }
    }
    Ok(out)
}

/// Items of a `v1/List` style document (`kind` ending in `List` with an `items` array).
fn list_items(json: &Json) -> Option<&Vec<Json>> {
    let kind = json.get("kind")?.as_str()?;
    if !kind.ends_with("List") {
        return None;
    }
    json.get("items")?.as_array()
}

fn target(json: Json) -> std::result::Result<Manifest, String> {
    if !json.is_object() {
        return Err("document is not a mapping".into());
    }
    if json.get("apiVersion").and_then(|v| v.as_str()).is_none() {
        return Err("YAML missing apiVersion".into());
    }
    let gvk = gvk_from_object(&json).ok_or("YAML missing kind")?;
    let name = json
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or("YAML missing metadata.name")?
        .to_string();
    let namespace = json
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Ok(Manifest { gvk, name, namespace, body: json })
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail out as soon as the budget is spent.
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_friendly() {
        let limits = Limits::default();
        let e1 = parse_manifests(b"kind: Foo\nmetadata:\n  name: x\n", &limits).unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);

        let e2 = parse_manifests(b"apiVersion: v1\nmetadata:\n  name: x\n", &limits).unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);

        let two = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\napiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        match parse_manifests(two, &limits) {
            Err(PilotError::InvalidManifest { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("missing metadata.name"), "reason={}", reason);
            }
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }

        let e4 = parse_manifests(b"- just\n- a list\n", &limits).unwrap_err().to_string();
        assert!(e4.contains("not a mapping"), "e4={}", e4);
    }

    #[test]
    fn lists_are_expanded_and_null_documents_skipped() {
        let data = b"~\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: a\n    namespace: argocd\n- apiVersion: apps/v1\n  kind: Deployment\n  metadata:\n    name: b\n";
        let out = parse_manifests(data, &Limits::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].gvk.kind, "Secret");
        assert_eq!(out[0].namespace.as_deref(), Some("argocd"));
        assert_eq!(out[1].gvk.group, "apps");
        assert!(out[1].namespace.is_none());
    }

    #[test]
    fn size_guards_apply() {
        let doc = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\ndata:\n  a: '1'\n  b: '2'\n  c: '3'\n";
        let tight_bytes = Limits { max_bytes: 10, max_nodes: 1_000 };
        assert!(matches!(parse_manifests(doc, &tight_bytes), Err(PilotError::InvalidRequest(_))));
        let tight_nodes = Limits { max_bytes: 1_000, max_nodes: 5 };
        let e = parse_manifests(doc, &tight_nodes).unwrap_err().to_string();
        assert!(e.contains("too complex"), "e={}", e);
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(!json_node_budget_exceeded(&v, 10));
        assert!(json_node_budget_exceeded(&v, 3));
    }
}
