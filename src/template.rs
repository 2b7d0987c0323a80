//! Notification text rendering.
//!
//! Templates substitute `{{ dotted.path }}` tokens with values looked up in
//! the event document. Nothing else is interpreted: document content is
//! untrusted, so there is no expression language.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::RenderError;
use crate::event::object_id_hex;

/// Rendered in place of missing or null values.
pub const MISSING_PLACEHOLDER: &str = "\u{2014}";

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("static template pattern"))
}

/// Render `template` against `document`.
pub fn render(template: &str, document: &Value) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in token_pattern().captures_iter(template) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        push_literal(&mut out, template, last, whole.start())?;

        let path = path.as_str().trim();
        if path.is_empty() {
            return Err(RenderError::EmptyPath {
                offset: whole.start(),
            });
        }
        out.push_str(&stringify(lookup(document, path)));
        last = whole.end();
    }

    push_literal(&mut out, template, last, template.len())?;
    Ok(out)
}

fn push_literal(out: &mut String, template: &str, start: usize, end: usize) -> Result<(), RenderError> {
    let literal = &template[start..end];
    if let Some(pos) = literal.find("{{") {
        return Err(RenderError::Unterminated { offset: start + pos });
    }
    out.push_str(literal);
    Ok(())
}

/// Walk `path` (dot separated) into `document`. Numeric segments index arrays.
#[must_use]
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        let segment = segment.trim();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => MISSING_PLACEHOLDER.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => object_id_hex(other).map_or_else(|| other.to_string(), str::to_string),
    }
}
