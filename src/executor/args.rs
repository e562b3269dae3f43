//! Task argument resolution.
//!
//! Resolution order per argument:
//! 1. `static_arguments` literal — used as-is.
//! 2. `static_arguments` reference — `nodeId[.path]`, `nodeId[index][.path]`,
//!    or a template literal `` `…${expr}…` ``. A bare node id is mapped to
//!    task id `task_<nodeId>` when no task named `<nodeId>` exists.
//! 3. `static_arguments` parameter — looked up in the caller's parameter map.
//! 4. Legacy `$OUTPUT[task_id][.path]` tokens inside `arguments` values.
//! 5. Remaining `arguments` values pass through; nested objects are recursed.
//!
//! Unresolvable references produce no value at all (emission is skipped for
//! undefined), matching reference semantics rather than erroring the task.

use super::dag::{StaticArg, Task};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Completed task outputs keyed by task id.
pub type TaskOutputs = HashMap<String, Value>;

pub fn resolve_arguments(
    task: &Task,
    outputs: &TaskOutputs,
    parameters: &Map<String, Value>,
) -> Map<String, Value> {
    let mut resolved = Map::new();

    for (name, arg) in &task.static_arguments {
        let value = match arg {
            StaticArg::Literal { value } => Some(value.clone()),
            StaticArg::Reference { expression } => resolve_expression(expression, outputs),
            StaticArg::Parameter { name } => parameters.get(name).cloned(),
        };
        if let Some(value) = value {
            resolved.insert(name.clone(), value);
        }
    }

    for (name, value) in &task.arguments {
        if resolved.contains_key(name) {
            continue;
        }
        if let Some(value) = resolve_value(value, outputs) {
            resolved.insert(name.clone(), value);
        }
    }

    resolved
}

/// Resolve a reference expression or template literal against task outputs.
pub fn resolve_expression(expression: &str, outputs: &TaskOutputs) -> Option<Value> {
    let expression = expression.trim();
    if let Some(inner) = expression
        .strip_prefix('`')
        .and_then(|rest| rest.strip_suffix('`'))
    {
        return resolve_template(inner, outputs);
    }
    resolve_path_expression(expression, outputs)
}

/// `` `text ${expr} text` `` — every embedded expression must resolve; an
/// undefined part makes the whole template undefined.
fn resolve_template(template: &str, outputs: &TaskOutputs) -> Option<Value> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}')?;
        let value = resolve_path_expression(after[..end].trim(), outputs)?;
        out.push_str(&value_to_string(&value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(Value::String(out))
}

/// `nodeId`, `nodeId.path.to.field`, `nodeId[2].field`, …
fn resolve_path_expression(expression: &str, outputs: &TaskOutputs) -> Option<Value> {
    let ident_end = expression
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(expression.len());
    let (ident, path) = expression.split_at(ident_end);
    if ident.is_empty() {
        return None;
    }

    // Plan node ids map onto `task_<id>` task ids; accept either spelling.
    let root = outputs
        .get(ident)
        .or_else(|| outputs.get(&format!("task_{ident}")))?;
    follow_path(root, path)
}

/// Walk `.field` and `[index]` accessors.
fn follow_path<'a>(root: &'a Value, path: &str) -> Option<Value> {
    let mut current: &'a Value = root;
    let mut rest = path;
    loop {
        if rest.is_empty() {
            return Some(current.clone());
        }
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let index: usize = after[..end].trim().parse().ok()?;
            current = current.as_array()?.get(index)?;
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(after.len());
            let (field, tail) = after.split_at(end);
            if field.is_empty() {
                return None;
            }
            current = current.as_object()?.get(field)?;
            rest = tail;
        } else {
            return None;
        }
    }
}

/// Legacy `$OUTPUT[task_id][.path]` substitution inside plain argument values.
fn resolve_value(value: &Value, outputs: &TaskOutputs) -> Option<Value> {
    match value {
        Value::String(s) => resolve_legacy_string(s, outputs),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if let Some(v) = resolve_value(v, outputs) {
                    out.insert(k.clone(), v);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|v| resolve_value(v, outputs))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

fn resolve_legacy_string(s: &str, outputs: &TaskOutputs) -> Option<Value> {
    const TOKEN: &str = "$OUTPUT[";
    if !s.contains(TOKEN) {
        return Some(Value::String(s.to_string()));
    }

    // A string that is exactly one token keeps the referenced value's type.
    if let Some((value, consumed)) = parse_legacy_token(s, outputs) {
        if consumed == s.len() {
            return Some(value);
        }
    }

    // Otherwise substitute each token textually.
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find(TOKEN) {
        out.push_str(&rest[..start]);
        let (value, consumed) = parse_legacy_token(&rest[start..], outputs)?;
        out.push_str(&value_to_string(&value));
        rest = &rest[start + consumed..];
    }
    out.push_str(rest);
    Some(Value::String(out))
}

/// Parse one `$OUTPUT[task_id][.path]` token at the start of `s`, returning
/// the resolved value and the number of bytes consumed.
fn parse_legacy_token(s: &str, outputs: &TaskOutputs) -> Option<(Value, usize)> {
    let after = s.strip_prefix("$OUTPUT[")?;
    let close = after.find(']')?;
    let task_id = &after[..close];
    let root = outputs.get(task_id)?;

    let tail = &after[close + 1..];
    let path_end = tail
        .find(|c: char| c.is_whitespace() || c == ',' || c == '"')
        .unwrap_or(tail.len());
    let path = &tail[..path_end];
    // The path must be a chain of accessors, else stop at the bare token.
    let (resolved, path_len) = match follow_path(root, path) {
        Some(v) if !path.is_empty() => (v, path.len()),
        _ => (root.clone(), 0),
    };
    Some((resolved, "$OUTPUT[".len() + close + 1 + path_len))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
