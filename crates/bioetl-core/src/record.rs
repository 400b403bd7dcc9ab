//! Record collections exchanged with calling code.

use serde_json::{Map, Value};

/// One upstream entity as an opaque key→value map.
pub type Record = Map<String, Value>;

/// Unpacks the records held at `pointer` (the whole body when `None`).
///
/// An array yields its object members, a single object yields itself and
/// anything else yields nothing.
pub fn records_at(body: &Value, pointer: Option<&str>) -> Vec<Record> {
    let target = match pointer.filter(|pointer| !pointer.is_empty()) {
        Some(pointer) => body.pointer(pointer),
        None => Some(body),
    };

    match target {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        Some(Value::Object(object)) => vec![object.clone()],
        _ => Vec::new(),
    }
}

/// String form of a scalar field, if present.
pub fn scalar_field(record: &Record, field: &str) -> Option<String> {
    record.get(field).and_then(scalar_to_string)
}

/// Collects every scalar found under any of `fields`, at any depth.
pub fn identifier_values(record: &Record, fields: &[String]) -> Vec<String> {
    let mut values = Vec::new();
    collect_object(record, fields, &mut values);
    values
}

fn collect_object(object: &Record, fields: &[String], values: &mut Vec<String>) {
    for (key, value) in object {
        if fields.iter().any(|field| field == key) {
            collect_scalars(value, values);
        } else {
            collect_nested(value, fields, values);
        }
    }
}

fn collect_nested(value: &Value, fields: &[String], values: &mut Vec<String>) {
    match value {
        Value::Object(object) => collect_object(object, fields, values),
        Value::Array(items) => {
            for item in items {
                collect_nested(item, fields, values);
            }
        }
        _ => {}
    }
}

fn collect_scalars(value: &Value, values: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_scalars(item, values);
            }
        }
        other => values.extend(scalar_to_string(other)),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Appends `incoming` records that are not already present in `records`.
/// Returns how many were added.
pub fn merge_unique(records: &mut Vec<Record>, incoming: Vec<Record>) -> usize {
    let mut added = 0;
    for record in incoming {
        if !records.contains(&record) {
            records.push(record);
            added += 1;
        }
    }
    added
}
