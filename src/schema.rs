//! JSON-Schema sanitizer for upstream tool declarations.
//!
//! The upstream's schema parser is stricter than JSON Schema proper and
//! rejects a number of common keywords. Clients send whatever their SDK
//! produces, so every tool schema passes through here before dispatch.
//!
//! The exact keyword set was derived empirically against the upstream; the
//! test suite below is the documentation of record. Sanitization is pure
//! and idempotent: sanitizing twice yields the same value.

use serde_json::{Map, Value};

/// Keywords the upstream rejects outright.
const STRIP_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "title",
    "default",
    "examples",
    "additionalProperties",
    "patternProperties",
];

/// `format` values the upstream accepts; anything else is dropped.
const ALLOWED_FORMATS: &[&str] = &["date-time", "date", "time", "duration", "enum"];

/// Local refs are inlined at most this deep before being dropped, which
/// keeps cyclic defs from recursing forever.
const MAX_REF_DEPTH: usize = 8;

/// Sanitize a tool input schema into a form the upstream accepts.
pub fn sanitize_schema(schema: &Value) -> Value {
    let defs = collect_defs(schema);
    let mut out = schema.clone();
    sanitize_node(&mut out, &defs);
    out
}

fn collect_defs(root: &Value) -> Map<String, Value> {
    let mut defs = Map::new();
    if let Some(obj) = root.as_object() {
        for table in ["$defs", "definitions"] {
            if let Some(entries) = obj.get(table).and_then(Value::as_object) {
                for (name, def) in entries {
                    defs.insert(name.clone(), def.clone());
                }
            }
        }
    }
    defs
}

/// Sanitize in place. Returns whether the node's original `type` array
/// admitted null, so the enclosing object can relax `required`.
fn sanitize_node(node: &mut Value, defs: &Map<String, Value>) -> bool {
    match node {
        Value::Object(_) => sanitize_object(node, defs),
        Value::Array(items) => {
            for item in items {
                sanitize_node(item, defs);
            }
            false
        }
        _ => false,
    }
}

fn sanitize_object(node: &mut Value, defs: &Map<String, Value>) -> bool {
    resolve_ref(node, defs);

    // A single-element anyOf/oneOf is just that element.
    let collapsed = node.as_object().and_then(|obj| {
        ["anyOf", "oneOf"].iter().find_map(|key| {
            obj.get(*key)
                .and_then(Value::as_array)
                .filter(|arr| arr.len() == 1)
                .map(|arr| arr[0].clone())
        })
    });
    if let Some(inner) = collapsed {
        *node = inner;
        return sanitize_node(node, defs);
    }

    let Some(obj) = node.as_object_mut() else {
        return false;
    };

    for key in STRIP_KEYS {
        obj.remove(*key);
    }

    // Once refs are inlined nothing points at the defs tables.
    obj.remove("$defs");
    obj.remove("definitions");

    // Boolean-form exclusive bounds (draft-04) are rejected; the numeric
    // form is kept.
    for key in ["exclusiveMinimum", "exclusiveMaximum"] {
        if obj.get(key).map(Value::is_boolean).unwrap_or(false) {
            obj.remove(key);
        }
    }

    if let Some(format) = obj.get("format").and_then(Value::as_str) {
        if !ALLOWED_FORMATS.contains(&format) {
            obj.remove("format");
        }
    }

    // `type` must be a single string. An array form keeps its first
    // non-null entry; nullability is reported to the caller.
    let nullable = normalize_type(obj);

    // `properties` must be an object, never an array.
    if obj
        .get("properties")
        .map(|p| !p.is_object())
        .unwrap_or(false)
    {
        obj.insert("properties".to_string(), Value::Object(Map::new()));
    }

    let mut newly_optional: Vec<String> = Vec::new();
    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for (name, prop) in props.iter_mut() {
            if sanitize_node(prop, defs) {
                newly_optional.push(name.clone());
            }
        }
    }

    if !newly_optional.is_empty() {
        if let Some(required) = obj.get_mut("required").and_then(Value::as_array_mut) {
            required.retain(|name| {
                name.as_str()
                    .map(|n| !newly_optional.iter().any(|o| o == n))
                    .unwrap_or(true)
            });
        }
    }

    // Remaining schema-valued members (items, contains, not, multi-element
    // anyOf/oneOf/allOf, ...).
    for (key, value) in obj.iter_mut() {
        if key != "properties" && key != "enum" && key != "required" {
            sanitize_node(value, defs);
        }
    }

    nullable
}

/// Inline local `#/$defs/...` pointers; drop refs that cannot be resolved
/// (external URIs, unknown names, cycles past [`MAX_REF_DEPTH`]).
fn resolve_ref(node: &mut Value, defs: &Map<String, Value>) {
    for _ in 0..MAX_REF_DEPTH {
        let Some(target) = node
            .as_object()
            .and_then(|obj| obj.get("$ref").and_then(Value::as_str).map(str::to_string))
        else {
            return;
        };

        let name = target
            .strip_prefix("#/$defs/")
            .or_else(|| target.strip_prefix("#/definitions/"));

        match name.and_then(|n| defs.get(n)) {
            Some(def) => *node = def.clone(),
            None => {
                if let Some(obj) = node.as_object_mut() {
                    obj.remove("$ref");
                }
                return;
            }
        }
    }

    if let Some(obj) = node.as_object_mut() {
        obj.remove("$ref");
    }
}

/// Force `type` to a single string, returning whether the original array
/// form allowed null.
fn normalize_type(obj: &mut Map<String, Value>) -> bool {
    let Some(types) = obj.get("type").and_then(Value::as_array) else {
        return false;
    };

    let had_null = types.iter().any(|t| t.as_str() == Some("null"));
    let first = types
        .iter()
        .find_map(|t| t.as_str().filter(|s| *s != "null"))
        .unwrap_or("string")
        .to_string();
    obj.insert("type".to_string(), Value::String(first));
    had_null
}
