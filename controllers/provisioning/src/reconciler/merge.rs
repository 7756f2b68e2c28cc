//! Deep merge of configuration documents.
//!
//! The overlay (`src`) is merged into the defaults (`dst`):
//! maps merge recursively, sequences merge element by element by index, and
//! anything else is overridden by the overlay. With `check_type` set, a type
//! mismatch between the two sides is an error instead of an override.

use serde_json::{Map, Value};

/// Type name used in mismatch errors
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "[]interface {}",
        Value::Object(_) => "map[string]interface {}",
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    type_name(a) == type_name(b)
}

/// Merge `src` into `dst`
pub fn deep_merge_maps(
    dst: &mut Map<String, Value>,
    src: &Map<String, Value>,
    check_type: bool,
) -> Result<(), String> {
    for (key, src_value) in src {
        let Some(dst_value) = dst.get_mut(key) else {
            dst.insert(key.clone(), src_value.clone());
            continue;
        };

        if !same_type(dst_value, src_value) {
            if check_type {
                return Err(format!(
                    "type mismatch for key: {key} (dst: {}, src: {})",
                    type_name(dst_value),
                    type_name(src_value)
                ));
            }
            *dst_value = src_value.clone();
            continue;
        }

        match (dst_value, src_value) {
            (Value::Object(d), Value::Object(s)) => {
                deep_merge_maps(d, s, check_type)
                    .map_err(|e| format!("error merging maps for key: {key}: {e}"))?;
            }
            (Value::Array(d), Value::Array(s)) => {
                deep_merge_slices(d, s, check_type)
                    .map_err(|e| format!("error merging slices for key: {key}: {e}"))?;
            }
            (d, s) => *d = s.clone(),
        }
    }
    Ok(())
}

/// Merge `src` into `dst` by index.
///
/// Trailing elements of the longer side are kept.
pub fn deep_merge_slices(
    dst: &mut Vec<Value>,
    src: &[Value],
    check_type: bool,
) -> Result<(), String> {
    for (index, src_elem) in src.iter().enumerate() {
        let Some(dst_elem) = dst.get_mut(index) else {
            dst.push(src_elem.clone());
            continue;
        };

        if !same_type(dst_elem, src_elem) {
            if check_type {
                return Err(format!(
                    "type mismatch at index: {index} (dst: {}, src: {})",
                    type_name(dst_elem),
                    type_name(src_elem)
                ));
            }
            *dst_elem = src_elem.clone();
            continue;
        }

        match (dst_elem, src_elem) {
            (Value::Object(d), Value::Object(s)) => {
                deep_merge_maps(d, s, check_type)
                    .map_err(|e| format!("error merging maps at index: {index}: {e}"))?;
            }
            (d, s) => *d = s.clone(),
        }
    }
    Ok(())
}

/// Merge two documents, returning the merged copy
pub fn merge_documents(defaults: &Value, overlay: &Value, check_type: bool) -> Result<Value, String> {
    match (defaults, overlay) {
        (Value::Object(d), Value::Object(s)) => {
            let mut merged = d.clone();
            deep_merge_maps(&mut merged, s, check_type)?;
            Ok(Value::Object(merged))
        }
        (d, Value::Null) => Ok(d.clone()),
        (Value::Null, s) => Ok(s.clone()),
        (d, s) => Err(format!(
            "expected two maps to merge (dst: {}, src: {})",
            type_name(d),
            type_name(s)
        )),
    }
}
