//! Structural and adversarial checks run before a document is trusted.
//!
//! Checks run in a fixed order and the first failure wins:
//! reserved keys, version, container shapes, text fields, candidate keys,
//! identity fields. `Fraud` results must never be repaired by the caller.

use std::collections::HashSet;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{
    value_i64, CandidateField, Day, CANDIDATE_SHORT_MAX, CANDIDATE_UUID_KEY, CARD_TEXT_LIMITS,
    COLUMN_NAME_MAX, CURRENT_VERSION, DAY_CONTENT_MAX, DAY_TIME_MAX, ID_MAX, TIMESTAMP_MAX,
    TODO_TEXT_MAX, WEEK_KEY_MAX,
};

pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Lowercased, whitespace-collapsed fragments that only show up in injection payloads.
const SUSPICIOUS_FRAGMENTS: [&str; 9] = [
    ";--",
    "drop table",
    "drop database",
    "truncate table",
    "union select",
    "union all select",
    "xp_cmdshell",
    "' or '1'='1",
    "' or 1=1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    /// Malformed but not hostile.
    Broken,
    /// Looks crafted: reserved keys or injection-shaped text.
    Fraud,
}

impl ValidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationKind::Broken => "broken",
            ValidationKind::Fraud => "fraud",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
}

impl ValidationError {
    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::Broken,
            message: message.into(),
        }
    }

    pub fn fraud(message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::Fraud,
            message: message.into(),
        }
    }
}

type Check = Result<(), ValidationError>;

pub fn validate(document: &Value) -> Check {
    check_reserved_keys(document, "database")?;
    let Some(root) = document.as_object() else {
        return Err(ValidationError::broken("Database payload is not an object."));
    };
    check_version(root)?;
    let shape = check_containers(root)?;
    check_text_fields(&shape)?;
    check_recycle_text(root)?;
    check_candidate_keys(&shape)?;
    check_identities(&shape)
}

/// Borrowed views of the containers once their shape is known to be right.
struct Shape<'a> {
    columns: Vec<&'a Map<String, Value>>,
    cards: Vec<&'a Map<String, Value>>,
    candidates: Vec<&'a Map<String, Value>>,
    weeks: Vec<(&'a str, &'a Map<String, Value>)>,
    todos: Vec<&'a Map<String, Value>>,
}

fn check_reserved_keys(value: &Value, path: &str) -> Check {
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                if RESERVED_KEYS.contains(&key.as_str()) {
                    return Err(ValidationError::fraud(format!(
                        "Reserved key `{key}` found in {path}."
                    )));
                }
                check_reserved_keys(child, path)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| check_reserved_keys(item, path)),
        _ => Ok(()),
    }
}

fn check_version(root: &Map<String, Value>) -> Check {
    let version = value_i64(root.get("version"));
    if version > i64::from(CURRENT_VERSION) {
        return Err(ValidationError::broken(
            "Database version is newer than this app supports.",
        ));
    }
    Ok(())
}

fn objects<'a>(value: Option<&'a Value>, label: &str) -> Result<Vec<&'a Map<String, Value>>, ValidationError> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Err(ValidationError::broken(format!("{label} are missing.")));
    };
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| ValidationError::broken(format!("{label} contain a non-record entry.")))
        })
        .collect()
}

fn check_containers(root: &Map<String, Value>) -> Result<Shape<'_>, ValidationError> {
    let Some(kanban) = root.get("kanban").and_then(Value::as_object) else {
        return Err(ValidationError::broken("Kanban data is missing or invalid."));
    };
    let columns = objects(kanban.get("columns"), "Kanban columns")?;
    let cards = objects(kanban.get("cards"), "Kanban cards")?;
    let candidates = objects(kanban.get("candidates"), "Candidate rows")?;

    let Some(weekly) = root.get("weekly").and_then(Value::as_object) else {
        return Err(ValidationError::broken("Weekly data is invalid."));
    };
    let mut weeks = Vec::with_capacity(weekly.len());
    for (key, week) in weekly {
        let Some(week_obj) = week.as_object() else {
            return Err(ValidationError::broken("Weekly data is invalid."));
        };
        match week_obj.get("entries") {
            None => {}
            Some(Value::Object(entries)) => {
                for (day, entry) in entries {
                    if day.parse::<Day>().is_err() {
                        return Err(ValidationError::broken(format!(
                            "Weekly entry day `{day}` is not a weekday."
                        )));
                    }
                    if !entry.is_object() {
                        return Err(ValidationError::broken("Weekly entries are invalid."));
                    }
                }
            }
            Some(_) => return Err(ValidationError::broken("Weekly entries are invalid.")),
        }
        weeks.push((key.as_str(), week_obj));
    }

    let todos = objects(root.get("todos"), "Todo items").map_err(|_| {
        ValidationError::broken("Todo data is invalid.")
    })?;

    if let Some(recycle) = root.get("recycle") {
        let Some(recycle) = recycle.as_object() else {
            return Err(ValidationError::broken("Recycle data is invalid."));
        };
        for key in ["items", "redo"] {
            if recycle.get(key).is_some_and(|list| !list.is_array()) {
                return Err(ValidationError::broken("Recycle data is invalid."));
            }
        }
    }

    Ok(Shape {
        columns,
        cards,
        candidates,
        weeks,
        todos,
    })
}

/// Control characters other than ordinary whitespace, or SQL-injection-shaped text.
pub fn is_suspicious(text: &str) -> bool {
    if text
        .chars()
        .any(|ch| ch.is_control() && !matches!(ch, '\n' | '\r' | '\t'))
    {
        return true;
    }
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let squeezed: String = lowered.chars().filter(|ch| !ch.is_whitespace()).collect();
    if squeezed.contains(";--") {
        return true;
    }
    if let Some(open) = collapsed.find("/*") {
        if collapsed[open + 2..].contains("*/") {
            return true;
        }
    }
    SUSPICIOUS_FRAGMENTS
        .iter()
        .any(|fragment| collapsed.contains(fragment))
}

fn check_text(obj: &Map<String, Value>, key: &str, max_len: usize, label: &str) -> Check {
    let Some(value) = obj.get(key) else {
        return Ok(());
    };
    let text = match value {
        Value::Null => return Ok(()),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => {
            return Err(ValidationError::broken(format!(
                "{label} field `{key}` must be text."
            )))
        }
    };
    check_text_value(&text, max_len, &format!("{label} field `{key}`"))
}

fn check_text_value(text: &str, max_len: usize, label: &str) -> Check {
    if text.chars().count() > max_len {
        return Err(ValidationError::broken(format!(
            "{label} is longer than {max_len} characters."
        )));
    }
    if is_suspicious(text) {
        return Err(ValidationError::fraud(format!(
            "{label} contains suspicious content."
        )));
    }
    Ok(())
}

fn check_text_fields(shape: &Shape<'_>) -> Check {
    for column in &shape.columns {
        check_text(column, "id", ID_MAX, "Column")?;
        check_text(column, "name", COLUMN_NAME_MAX, "Column")?;
        check_text(column, "created_at", TIMESTAMP_MAX, "Column")?;
        check_text(column, "updated_at", TIMESTAMP_MAX, "Column")?;
    }
    for card in &shape.cards {
        for (key, max_len) in CARD_TEXT_LIMITS {
            check_text(card, key, max_len, "Card")?;
        }
        check_text(card, "updated_at", TIMESTAMP_MAX, "Card")?;
    }
    for row in &shape.candidates {
        for key in row.keys() {
            let max_len = if key == CANDIDATE_UUID_KEY {
                ID_MAX
            } else {
                key.parse::<CandidateField>()
                    .map(CandidateField::max_len)
                    .unwrap_or(CANDIDATE_SHORT_MAX)
            };
            check_text(row, key, max_len, "Candidate")?;
        }
    }
    for (key, week) in &shape.weeks {
        check_text_value(key, WEEK_KEY_MAX, "Week key")?;
        check_text(week, "week_start", WEEK_KEY_MAX, "Week")?;
        check_text(week, "week_end", WEEK_KEY_MAX, "Week")?;
        let Some(entries) = week.get("entries").and_then(Value::as_object) else {
            continue;
        };
        for entry in entries.values().filter_map(Value::as_object) {
            check_text(entry, "start", DAY_TIME_MAX, "Weekly entry")?;
            check_text(entry, "end", DAY_TIME_MAX, "Weekly entry")?;
            check_text(entry, "content", DAY_CONTENT_MAX, "Weekly entry")?;
        }
    }
    for todo in &shape.todos {
        check_text(todo, "id", ID_MAX, "Todo")?;
        check_text(todo, "text", TODO_TEXT_MAX, "Todo")?;
        check_text(todo, "createdAt", TIMESTAMP_MAX, "Todo")?;
    }
    Ok(())
}

/// Snapshots can be restored later, so their text is screened too.
fn check_recycle_text(root: &Map<String, Value>) -> Check {
    fn walk(value: &Value) -> Check {
        match value {
            Value::String(text) if is_suspicious(text) => Err(ValidationError::fraud(
                "Recycle bin contains suspicious content.",
            )),
            Value::Array(items) => items.iter().try_for_each(walk),
            Value::Object(obj) => obj.values().try_for_each(walk),
            _ => Ok(()),
        }
    }
    root.get("recycle").map(walk).unwrap_or(Ok(()))
}

fn check_candidate_keys(shape: &Shape<'_>) -> Check {
    for row in &shape.candidates {
        for key in row.keys() {
            if key != CANDIDATE_UUID_KEY && key.parse::<CandidateField>().is_err() {
                return Err(ValidationError::broken(format!(
                    "Candidate rows contain an unknown field `{key}`."
                )));
            }
        }
    }
    Ok(())
}

fn identity<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

fn check_unique<'a>(
    ids: impl Iterator<Item = Option<&'a str>>,
    missing: &str,
    duplicate: &str,
) -> Result<HashSet<&'a str>, ValidationError> {
    let mut seen = HashSet::new();
    for id in ids {
        let Some(id) = id else {
            return Err(ValidationError::broken(missing));
        };
        if !seen.insert(id) {
            return Err(ValidationError::broken(duplicate));
        }
    }
    Ok(seen)
}

fn check_identities(shape: &Shape<'_>) -> Check {
    let column_ids = check_unique(
        shape.columns.iter().map(|column| identity(column, "id")),
        "Column IDs are invalid.",
        "Column IDs are duplicated.",
    )?;
    check_unique(
        shape.cards.iter().map(|card| identity(card, "uuid")),
        "Card IDs are invalid.",
        "Card IDs are duplicated.",
    )?;
    for card in &shape.cards {
        match identity(card, "column_id") {
            Some(column_id) if column_ids.contains(column_id) => {}
            _ => {
                return Err(ValidationError::broken(
                    "Card column references are invalid.",
                ))
            }
        }
    }
    check_unique(
        shape
            .candidates
            .iter()
            .map(|row| identity(row, CANDIDATE_UUID_KEY)),
        "Candidate UUIDs are missing.",
        "Candidate UUIDs are duplicated.",
    )?;
    check_unique(
        shape.todos.iter().map(|todo| identity(todo, "id")),
        "Todo IDs are invalid.",
        "Todo IDs are duplicated.",
    )?;
    if shape
        .todos
        .iter()
        .any(|todo| !todo.get("done").is_some_and(Value::is_boolean))
    {
        return Err(ValidationError::broken("Todo done flags are invalid."));
    }
    Ok(())
}
