//! # Template Renderer
//!
//! Pure `{{path.to.value}}` substitution over JSON values. Rendering has no
//! access to anything beyond the `{input, context, run}` envelope and never
//! performs I/O.

use crate::models::workflow_definition::HttpRequestSpec;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Build the data envelope a run exposes to its step templates.
pub fn envelope(input: &Value, context: &Value, run_id: Uuid) -> Value {
    json!({
        "input": input,
        "context": context,
        "run": { "id": run_id.to_string() },
    })
}

/// Recursively render a value: strings get `{{path}}` substitution, arrays
/// and maps recurse, non-string scalars pass through unchanged.
pub fn render_value(value: &Value, data: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_string(s, data)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| render_value(item, data)).collect())
        }
        Value::Object(map) => {
            let rendered: Map<String, Value> = map
                .iter()
                .map(|(key, item)| (key.clone(), render_value(item, data)))
                .collect();
            Value::Object(rendered)
        }
        scalar => scalar.clone(),
    }
}

/// Render a request spec's headers and body against the envelope. Method
/// and URL are taken as declared.
pub fn render_request(spec: &HttpRequestSpec, data: &Value) -> HttpRequestSpec {
    HttpRequestSpec {
        method: spec.method.clone(),
        url: spec.url.clone(),
        headers: spec.headers.as_ref().map(|headers| {
            headers
                .iter()
                .map(|(key, value)| (key.clone(), render_string(value, data)))
                .collect()
        }),
        body: spec.body.as_ref().map(|body| render_value(body, data)),
    }
}

/// Replace every `{{path}}` occurrence in a string.
fn render_string(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let path = after_open[..close].trim();
                out.push_str(&resolve_to_string(data, path));
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated placeholder, keep the raw text.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Resolve a dotted path through nested maps. A missing segment, or a
/// traversal into a non-map, yields the empty string.
fn resolve_to_string(data: &Value, path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut current = data;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return String::new(),
            },
            _ => return String::new(),
        }
    }

    value_to_string(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => composite.to_string(),
    }
}
