//! Structural helpers over input item sequences

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque conversation record. Only `role` and structural equality matter.
pub type InputItem = Value;

/// Owned copy of an input sequence. `Value` owns all of its children, so the
/// copy never aliases the caller's array.
pub fn clone_input(input: &[InputItem]) -> Vec<InputItem> {
    input.to_vec()
}

pub fn items_equal(a: &InputItem, b: &InputItem) -> bool {
    a == b
}

/// Returns `None` when `previous` is an exact in-order prefix of `incoming`,
/// otherwise the first index at which they disagree. A shorter `incoming`
/// reports its own length.
pub fn prefix_mismatch(previous: &[InputItem], incoming: &[InputItem]) -> Option<usize> {
    if let Some(index) = previous
        .iter()
        .zip(incoming)
        .position(|(a, b)| !items_equal(a, b))
    {
        return Some(index);
    }
    if incoming.len() < previous.len() {
        return Some(incoming.len());
    }
    None
}

/// Remove item `id` fields, which stateless upstream requests reject
pub fn strip_item_ids(input: &mut [InputItem]) {
    for item in input.iter_mut() {
        if let Some(obj) = item.as_object_mut() {
            obj.remove("id");
        }
    }
}

/// JSON serialization with object keys sorted at every level
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_stable(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Digest of a whole input sequence
pub fn hash_input(input: &[InputItem]) -> String {
    let mut hasher = Sha256::new();
    for item in input {
        hasher.update(stable_json(item).as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Concatenated text of an item's `content`, whether a string or a list of parts
pub fn item_text(item: &InputItem) -> String {
    match item.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
