//! Object matcher for generated workloads
//!
//! Decides whether a stored object has to be rewritten by diffing the
//! configuration the operator last applied (kept in an annotation) against
//! the newly generated one. Comparing against the last-applied snapshot
//! rather than the live object keeps server-populated defaults from
//! producing spurious updates.

use crate::error::Result;
use kube::Resource;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Annotation holding the normalized JSON of the last applied object
pub const LAST_APPLIED_ANNOTATION: &str = "apps.emqx.io/last-applied";

/// Metadata fields that take part in comparisons
const COMPARED_METADATA: &[&str] = &["name", "namespace", "labels", "annotations", "ownerReferences"];

/// Comparison strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculateOption {
    /// Drop `status` from both sides
    IgnoreStatusFields,
    /// Drop `apiVersion`, `kind` and `status` from every volume claim template
    IgnoreVolumeClaimTemplateTypeMetaAndStatus,
    /// Compare only `spec.template.spec`
    PodTemplateOnly,
}

/// Result of a comparison
#[derive(Debug, Clone, PartialEq)]
pub struct PatchResult {
    /// JSON merge patch turning the last applied state into the desired one
    pub patch: Value,
}

impl PatchResult {
    pub fn is_empty(&self) -> bool {
        matches!(&self.patch, Value::Object(m) if m.is_empty())
    }
}

/// Store the normalized form of `obj` in its last-applied annotation
pub fn set_last_applied<K>(obj: &mut K) -> Result<()>
where
    K: Resource + Serialize,
{
    let value = normalize(
        serde_json::to_value(&*obj)?,
        &[CalculateOption::IgnoreStatusFields],
    );
    let encoded = serde_json::to_string(&value)?;
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), encoded);
    Ok(())
}

/// Overwrite the field at `pointer` inside an existing last-applied snapshot.
/// Objects without a snapshot are left untouched.
pub fn update_last_applied<K: Resource>(obj: &mut K, pointer: &str, value: Value) -> Result<()> {
    let Some(annotations) = obj.meta_mut().annotations.as_mut() else {
        return Ok(());
    };
    let Some(encoded) = annotations.get_mut(LAST_APPLIED_ANNOTATION) else {
        return Ok(());
    };
    let mut snapshot: Value = serde_json::from_str(encoded)?;
    if let Some(slot) = snapshot.pointer_mut(pointer) {
        *slot = value;
        *encoded = serde_json::to_string(&snapshot)?;
    }
    Ok(())
}

/// Diff the stored object against the desired one
pub fn calculate<K>(current: &K, modified: &K, opts: &[CalculateOption]) -> Result<PatchResult>
where
    K: Resource + Serialize,
{
    let original = match current
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
    {
        Some(encoded) => serde_json::from_str(encoded)?,
        None => serde_json::to_value(current)?,
    };

    let original = normalize(original, opts);
    let modified = normalize(serde_json::to_value(modified)?, opts);

    Ok(PatchResult {
        patch: merge_diff(&original, &modified),
    })
}

fn normalize(value: Value, opts: &[CalculateOption]) -> Value {
    let Value::Object(mut root) = value else {
        return value;
    };

    root.remove("apiVersion");
    root.remove("kind");

    if let Some(Value::Object(meta)) = root.get_mut("metadata") {
        meta.retain(|k, _| COMPARED_METADATA.contains(&k.as_str()));
        let drop_annotations = match meta.get_mut("annotations") {
            Some(Value::Object(annotations)) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            }
            _ => false,
        };
        if drop_annotations {
            meta.remove("annotations");
        }
    }

    for opt in opts {
        match opt {
            CalculateOption::IgnoreStatusFields => {
                root.remove("status");
            }
            CalculateOption::IgnoreVolumeClaimTemplateTypeMetaAndStatus => {
                if let Some(Value::Array(templates)) = root
                    .get_mut("spec")
                    .and_then(|s| s.get_mut("volumeClaimTemplates"))
                {
                    for t in templates.iter_mut().filter_map(Value::as_object_mut) {
                        t.remove("apiVersion");
                        t.remove("kind");
                        t.remove("status");
                    }
                }
            }
            CalculateOption::PodTemplateOnly => {}
        }
    }

    if opts.contains(&CalculateOption::PodTemplateOnly) {
        let pod_spec = Value::Object(root)
            .pointer("/spec/template/spec")
            .cloned()
            .unwrap_or(Value::Null);
        return serde_json::json!({ "spec": { "template": { "spec": pod_spec } } });
    }

    Value::Object(root)
}

/// Compute a JSON merge patch (RFC 7386) from `original` to `modified`
fn merge_diff(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(o), Value::Object(m)) => {
            let mut patch = Map::new();
            for (k, mv) in m {
                match o.get(k) {
                    Some(ov) if ov == mv => {}
                    Some(ov) if ov.is_object() && mv.is_object() => {
                        let nested = merge_diff(ov, mv);
                        if !matches!(&nested, Value::Object(n) if n.is_empty()) {
                            patch.insert(k.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(k.clone(), mv.clone());
                    }
                }
            }
            for k in o.keys().filter(|k| !m.contains_key(*k)) {
                patch.insert(k.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        (o, m) if o == m => Value::Object(Map::new()),
        (_, m) => m.clone(),
    }
}
