//! Schema walker for parameter documents.
//!
//! Templates describe accepted request parameters with a JSON-Schema-like
//! document. This module validates a value tree against such a document and
//! inspects template schemas for the structure the controller relies on.
//! Every problem is collected; nothing stops at the first error.

use crds::{PARAM_CLUSTER_INSTANCE, PARAM_NODE_CLUSTER_NAME, PARAM_OCLOUD_SITE_ID, PARAM_POLICY_CONFIG};
use regex::Regex;
use serde_json::{Map, Value};

/// Top-level parameters every template must declare, with their types
pub const REQUIRED_PARAMETERS: &[(&str, &str)] = &[
    (PARAM_NODE_CLUSTER_NAME, "string"),
    (PARAM_OCLOUD_SITE_ID, "string"),
    (PARAM_CLUSTER_INSTANCE, "object"),
    (PARAM_POLICY_CONFIG, "object"),
];

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "(root)" } else { path }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match (expected, value) {
        ("integer", Value::Number(n)) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        ("number", Value::Number(_)) => true,
        _ => value_type(value) == expected,
    }
}

fn declared_types(schema: &Map<String, Value>) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn required_keys(schema: &Map<String, Value>) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Validate `value` against `schema`, appending path-qualified errors
pub fn validate_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };
    let here = display_path(path);

    let types = declared_types(schema);
    if !types.is_empty() && !types.iter().any(|t| matches_type(value, t)) {
        errors.push(format!(
            "{here}: expected type {}, got {}",
            types.join(" or "),
            value_type(value)
        ));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(format!("{here}: must be one of [{}]", options.join(", ")));
        }
    }

    match value {
        Value::Object(map) => validate_object(schema, map, path, errors),
        Value::Array(items) => validate_array(schema, items, path, errors),
        Value::String(s) => validate_string(schema, s, here, errors),
        Value::Number(n) => {
            if let Some(number) = n.as_f64() {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if number < min {
                        errors.push(format!("{here}: must be >= {min}"));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if number > max {
                        errors.push(format!("{here}: must be <= {max}"));
                    }
                }
            }
        }
        _ => {}
    }
}

fn validate_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) {
    for key in required_keys(schema) {
        if !map.contains_key(key) {
            errors.push(format!("{}: missing required property", join_path(path, key)));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (key, child) in map {
        let child_path = join_path(path, key);
        match properties.and_then(|p| p.get(key)) {
            Some(child_schema) => validate_value(child_schema, child, &child_path, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    errors.push(format!("{child_path}: unknown property"));
                }
                Some(extra @ Value::Object(_)) => {
                    validate_value(extra, child, &child_path, errors);
                }
                _ => {}
            },
        }
    }
}

fn validate_array(
    schema: &Map<String, Value>,
    items: &[Value],
    path: &str,
    errors: &mut Vec<String>,
) {
    let here = display_path(path);
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            errors.push(format!("{here}: must have at least {min} items"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            errors.push(format!("{here}: must have at most {max} items"));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (index, item) in items.iter().enumerate() {
            validate_value(item_schema, item, &format!("{path}[{index}]"), errors);
        }
    }
}

fn validate_string(schema: &Map<String, Value>, s: &str, here: &str, errors: &mut Vec<String>) {
    let length = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if length < min {
            errors.push(format!("{here}: must be at least {min} characters"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if length > max {
            errors.push(format!("{here}: must be at most {max} characters"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => {
                errors.push(format!("{here}: does not match pattern {pattern}"));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("{here}: invalid pattern {pattern}: {e}")),
        }
    }
}

/// Validate a whole document, joining every problem into one message
pub fn validate_document(schema: &Value, value: &Value) -> Result<(), String> {
    let mut errors = Vec::new();
    validate_value(schema, value, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Close every object schema that lists properties but says nothing about
/// extra ones, so unknown fields are rejected.
pub fn disallow_unknown_fields(schema: &mut Value) {
    let Some(map) = schema.as_object_mut() else {
        return;
    };
    if map.contains_key("properties") && !map.contains_key("additionalProperties") {
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }
    for key in ["properties", "patternProperties"] {
        if let Some(Value::Object(children)) = map.get_mut(key) {
            children.values_mut().for_each(disallow_unknown_fields);
        }
    }
    for key in ["items", "additionalProperties"] {
        if let Some(child @ Value::Object(_)) = map.get_mut(key) {
            disallow_unknown_fields(child);
        }
    }
}

/// Sub-schema of a top-level property
pub fn property_schema<'a>(schema: &'a Value, name: &str) -> Option<&'a Value> {
    schema.get("properties")?.get(name)
}

/// Check that the template schema declares every required parameter with
/// the right type. Missing and mistyped entries are reported together.
pub fn check_required_parameters(schema: &Value) -> Option<String> {
    let empty = Map::new();
    let root = schema.as_object().unwrap_or(&empty);
    let required = required_keys(root);
    let properties = root.get("properties").and_then(Value::as_object);

    let mut missing = Vec::new();
    let mut not_required = Vec::new();
    let mut wrong_type = Vec::new();
    for (name, expected) in REQUIRED_PARAMETERS {
        match properties.and_then(|p| p.get(*name)).and_then(Value::as_object) {
            None => missing.push(*name),
            Some(property) => {
                let types = declared_types(property);
                if types != [*expected] {
                    let actual = if types.is_empty() {
                        "none".to_string()
                    } else {
                        types.join(",")
                    };
                    wrong_type.push(format!("{name} (expected {expected}, got {actual})"));
                }
                if !required.contains(name) {
                    not_required.push(*name);
                }
            }
        }
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing required parameters: [{}]", missing.join(", ")));
    }
    if !not_required.is_empty() {
        problems.push(format!(
            "parameters not marked as required: [{}]",
            not_required.join(", ")
        ));
    }
    if !wrong_type.is_empty() {
        problems.push(format!(
            "parameters with incorrect type: [{}]",
            wrong_type.join(", ")
        ));
    }
    (!problems.is_empty()).then(|| {
        format!(
            "failed to validate templateParameterSchema: {}",
            problems.join("; ")
        )
    })
}

fn child<'a>(schema: &'a Value, key: &str) -> Option<&'a Value> {
    schema.get("properties").and_then(|p| p.get(key))
}

fn requires(schema: &Value, key: &str) -> bool {
    schema
        .as_object()
        .is_some_and(|m| required_keys(m).contains(&key))
}

/// Check the node definitions a template must describe when no hardware
/// profile supplies them. Problems carry a dotted locator into the schema.
pub fn check_node_schema(cluster_instance_schema: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let base = format!("{PARAM_CLUSTER_INSTANCE}.properties.nodes");

    let Some(nodes) = child(cluster_instance_schema, "nodes") else {
        problems.push(format!("{base}: node definitions are required"));
        return problems;
    };
    if nodes.get("type").and_then(Value::as_str) != Some("array") {
        problems.push(format!("{base}: expected type array"));
        return problems;
    }
    let Some(node) = nodes.get("items") else {
        problems.push(format!("{base}.items: node item schema is required"));
        return problems;
    };
    let node_path = format!("{base}.items");

    let bmc_path = format!("{node_path}.properties.bmcCredentialsDetails");
    match child(node, "bmcCredentialsDetails") {
        None => problems.push(format!("{bmc_path}: required")),
        Some(bmc) => {
            if !requires(node, "bmcCredentialsDetails") {
                problems.push(format!("{node_path}: must require bmcCredentialsDetails"));
            }
            let missing: Vec<&str> = ["username", "password"]
                .into_iter()
                .filter(|field| child(bmc, field).is_none() || !requires(bmc, field))
                .collect();
            if !missing.is_empty() {
                problems.push(format!("{bmc_path}: must require {}", missing.join(" and ")));
            }
        }
    }

    let iface_path = format!("{node_path}.properties.nodeNetwork.properties.interfaces.items");
    let interface = child(node, "nodeNetwork")
        .and_then(|n| child(n, "interfaces"))
        .and_then(|i| i.get("items"));
    match interface {
        None => problems.push(format!("{iface_path}: required")),
        Some(interface) => {
            let label_path = format!("{iface_path}.properties.label");
            match child(interface, "label") {
                Some(label)
                    if requires(interface, "label")
                        && label.get("minLength").and_then(Value::as_u64).unwrap_or(0) >= 1 => {}
                _ => problems.push(format!(
                    "{label_path}: must be required with minLength of at least 1"
                )),
            }
            let mac_path = format!("{iface_path}.properties.macAddress");
            match child(interface, "macAddress") {
                Some(mac)
                    if requires(interface, "macAddress")
                        && mac.get("pattern").and_then(Value::as_str).is_some() => {}
                _ => problems.push(format!("{mac_path}: must be required with a MAC pattern")),
            }
        }
    }

    problems
}
