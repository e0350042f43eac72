//! `{{stepId.response...}}` substitution over step fields.
//!
//! A field that is exactly one expression keeps the referenced JSON type; any
//! other text containing `{{` is rendered through handlebars in strict mode,
//! so a reference to a missing step is an error rather than an empty string.

use anyhow::{Result, anyhow};
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde_json::{Map as JsonMap, Value};

static REGISTRY: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);
    registry
});

pub fn render_value(template: &Value, ctx: &Value) -> Result<Value> {
    match template {
        Value::String(raw) => render_str(raw, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = JsonMap::new();
            for (key, value) in map {
                rendered.insert(key.clone(), render_value(value, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Render a field that must end up as text (URLs, keys, messages).
pub fn render_string(raw: &str, ctx: &Value) -> Result<String> {
    Ok(match render_str(raw, ctx)? {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Resolve a dotted path such as `fetch.response.body.items[0]`.
pub fn lookup<'a>(ctx: &'a Value, path: &str) -> Result<&'a Value> {
    let segments = parse_path(path).ok_or_else(|| anyhow!("`{path}` is not a valid path"))?;
    walk(ctx, &segments).ok_or_else(|| anyhow!("`{path}` not found"))
}

fn render_str(raw: &str, ctx: &Value) -> Result<Value> {
    if let Some(expr) = sole_expression(raw)
        && let Some(segments) = parse_path(expr)
    {
        return walk(ctx, &segments)
            .cloned()
            .ok_or_else(|| anyhow!("reference `{expr}` not found"));
    }
    if raw.contains("{{") {
        let rendered = REGISTRY
            .render_template(raw, ctx)
            .map_err(|err| anyhow!("template render failed: {err}"))?;
        return Ok(Value::String(rendered));
    }
    Ok(Value::String(raw.to_string()))
}

fn sole_expression(raw: &str) -> Option<&str> {
    let inner = raw.trim().strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.is_empty() || inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(expr: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in expr.trim().split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        let name = name.trim();
        if name.is_empty() && rest.is_empty() {
            return None;
        }
        if !name.is_empty() {
            if name.contains(char::is_whitespace) {
                return None;
            }
            segments.push(Segment::Key(name.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest[1..close].trim().parse::<usize>().ok()?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments)
}

fn walk<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}
