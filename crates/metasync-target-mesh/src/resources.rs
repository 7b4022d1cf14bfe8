//! Object bodies written by the mesh target

use crate::api::ResourceKind;
use crate::lua;
use metasync_core::{AddressRangeSet, Error, GatewaySelector, Result};
use serde_json::{Map, Value, json};

/// Data key holding the JSON-encoded CIDR list
pub const RANGES_KEY: &str = "ip_ranges";

/// Standard labels placed on every managed object
pub fn managed_labels(instance: &str) -> Value {
    json!({
        "app.kubernetes.io/name": "metasync",
        "app.kubernetes.io/instance": instance,
        "app.kubernetes.io/managed-by": "metasync-controller",
    })
}

/// Encode CIDRs as the document's data value
pub fn encode_ranges(cidrs: &[String]) -> Result<String> {
    Ok(serde_json::to_string(cidrs)?)
}

/// Recover the applied set from a stored document
///
/// A missing data key reads as empty. An undecodable value is a read error;
/// individual entries that are not valid prefixes are skipped.
pub fn decode_ranges(document: &Value) -> Result<AddressRangeSet> {
    let Some(raw) = document.pointer(&format!("/data/{}", RANGES_KEY)) else {
        return Ok(AddressRangeSet::new());
    };
    let raw = raw
        .as_str()
        .ok_or_else(|| Error::read(format!("{} is not a string", RANGES_KEY)))?;
    let cidrs: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| Error::read(format!("error decoding {}: {}", RANGES_KEY, e)))?;

    let mut set = AddressRangeSet::new();
    for cidr in &cidrs {
        if let Err(e) = set.add(cidr, std::iter::empty::<String>()) {
            tracing::warn!("Skipping stored range: {}", e);
        }
    }
    Ok(set)
}

/// New document object
pub fn config_map(name: &str, namespace: &str, instance: &str, ranges: &str) -> Value {
    json!({
        "apiVersion": ResourceKind::ConfigMap.api_version(),
        "kind": ResourceKind::ConfigMap.kind(),
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": managed_labels(instance),
        },
        "data": { RANGES_KEY: ranges },
    })
}

/// Existing document with its range key replaced
///
/// Other data keys and the resource version are kept.
pub fn with_ranges(mut existing: Value, ranges: &str) -> Value {
    if !existing.get("data").is_some_and(Value::is_object) {
        existing["data"] = Value::Object(Map::new());
    }
    existing["data"][RANGES_KEY] = Value::String(ranges.to_string());
    existing
}

/// Filter spec patching a Lua filter into the gateway's HTTP chain
pub fn envoy_filter_spec(selector: &GatewaySelector, header_name: &str, cidrs: &[String]) -> Value {
    let mut labels = Map::new();
    labels.insert("istio".to_string(), Value::String(selector.name.clone()));
    for (k, v) in &selector.labels {
        labels.insert(k.clone(), Value::String(v.clone()));
    }

    json!({
        "workloadSelector": { "labels": labels },
        "configPatches": [{
            "applyTo": "HTTP_FILTER",
            "match": {
                "context": "GATEWAY",
                "listener": {
                    "filterChain": {
                        "filter": { "name": "envoy.filters.network.http_connection_manager" }
                    }
                }
            },
            "patch": {
                "operation": "INSERT_BEFORE",
                "value": {
                    "name": "envoy.filters.http.lua",
                    "typed_config": {
                        "@type": "type.googleapis.com/envoy.extensions.filters.http.lua.v3.Lua",
                        "inline_code": lua::generate(header_name, cidrs),
                    }
                }
            }
        }]
    })
}

/// New filter object
pub fn envoy_filter(name: &str, namespace: &str, instance: &str, spec: Value) -> Value {
    json!({
        "apiVersion": ResourceKind::EnvoyFilter.api_version(),
        "kind": ResourceKind::EnvoyFilter.kind(),
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": managed_labels(instance),
        },
        "spec": spec,
    })
}

/// Existing filter with its spec replaced
pub fn with_spec(mut existing: Value, spec: Value) -> Value {
    existing["spec"] = spec;
    existing
}
