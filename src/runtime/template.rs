/// Template renderer for `simple` endpoints
///
/// Plain field substitution: `{{context.query.name}}` is replaced with the value
/// at that path. There are no loops, conditionals or filters. Missing values
/// render as an empty string.

use crate::runtime::context::RequestContext;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").ok())
        .as_ref()
}

/// Substitute every placeholder in `template`
pub fn render(template: &str, context: &RequestContext) -> String {
    let Some(pattern) = placeholder_pattern() else {
        return template.to_string();
    };
    if !template.contains("{{") {
        return template.to_string();
    }

    pattern
        .replace_all(template, |caps: &Captures| {
            lookup(context, &caps[1]).map(|v| display(&v)).unwrap_or_default()
        })
        .into_owned()
}

/// Render every string inside a JSON template
pub fn render_value(template: &Value, context: &RequestContext) -> Value {
    match template {
        Value::String(s) => Value::String(render(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a dotted path such as `context.body.user.name`
fn lookup(context: &RequestContext, expression: &str) -> Option<Value> {
    let path = expression.strip_prefix("context.").unwrap_or(expression);
    let mut segments = path.split('.');
    let mut current = context.section(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }

    Some(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
