//! Schema upgrades for stored databases.
//!
//! Migration works on raw JSON so the validator still sees whatever keys the
//! file carried. It only ever adds missing containers; field-level problems
//! are left for [`crate::validate`].

use serde_json::{json, Map, Value};

use crate::model::{version_number, CURRENT_VERSION};

type Step = fn(&mut Map<String, Value>);

/// `STEPS[n]` upgrades a version `n + 1` document to version `n + 2`.
const STEPS: [Step; (CURRENT_VERSION - 1) as usize] = [add_recycle_items, add_recycle_redo];

pub fn default_value() -> Value {
    json!({
        "version": CURRENT_VERSION,
        "kanban": {
            "columns": [],
            "cards": [],
            "candidates": [],
        },
        "weekly": {},
        "todos": [],
        "recycle": {
            "items": [],
            "redo": [],
        },
    })
}

/// Reads the stored version; absent or non-numeric counts as version 1.
/// Numeric strings are read as numbers, the same as the typed model does.
pub fn stored_version(value: &Value) -> i64 {
    value.as_object().map(version_of).unwrap_or(1)
}

fn version_of(obj: &Map<String, Value>) -> i64 {
    obj.get("version").map(version_number).unwrap_or(1)
}

/// Upgrades any accepted document shape to [`CURRENT_VERSION`]. Never fails.
///
/// A non-object input yields the default skeleton. Versions newer than this
/// build are left untouched so validation can refuse them.
pub fn migrate(raw: Value) -> Value {
    let Value::Object(mut obj) = raw else {
        return default_value();
    };

    let version = version_of(&obj);

    ensure_containers(&mut obj);

    if version > i64::from(CURRENT_VERSION) {
        return Value::Object(obj);
    }
    let from = usize::try_from(version - 1).unwrap_or(0);
    for (idx, step) in STEPS.iter().enumerate().skip(from) {
        tracing::debug!(from = idx + 1, to = idx + 2, "migrating database schema");
        step(&mut obj);
    }
    obj.insert("version".to_string(), json!(CURRENT_VERSION));
    Value::Object(obj)
}

fn ensure_containers(obj: &mut Map<String, Value>) {
    if !obj.get("kanban").is_some_and(Value::is_object) {
        obj.insert("kanban".to_string(), json!({}));
    }
    if let Some(kanban) = obj.get_mut("kanban").and_then(Value::as_object_mut) {
        for key in ["columns", "cards", "candidates"] {
            if !kanban.get(key).is_some_and(Value::is_array) {
                kanban.insert(key.to_string(), json!([]));
            }
        }
    }
    if !obj.get("weekly").is_some_and(Value::is_object) {
        obj.insert("weekly".to_string(), json!({}));
    }
    if !obj.get("todos").is_some_and(Value::is_array) {
        obj.insert("todos".to_string(), json!([]));
    }
    if !obj.get("recycle").is_some_and(Value::is_object) {
        obj.insert("recycle".to_string(), json!({}));
    }
    recycle_list(obj, "items");
    recycle_list(obj, "redo");
}

fn recycle_list(obj: &mut Map<String, Value>, key: &str) {
    if let Some(recycle) = obj.get_mut("recycle").and_then(Value::as_object_mut) {
        if !recycle.get(key).is_some_and(Value::is_array) {
            recycle.insert(key.to_string(), json!([]));
        }
    }
}

fn add_recycle_items(obj: &mut Map<String, Value>) {
    recycle_list(obj, "items");
}

fn add_recycle_redo(obj: &mut Map<String, Value>) {
    recycle_list(obj, "redo");
}
