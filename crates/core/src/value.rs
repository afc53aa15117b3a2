//! Data containers rules are evaluated against, and helpers for turning
//! resolved values into text.

use serde_json::Value;

/// The thing a rule is evaluated against.
///
/// Response bodies are classified once into markup or JSON; list extraction
/// produces one sub-container per future entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Container {
    /// An HTML document or fragment.
    Markup(String),
    /// A parsed JSON value.
    Json(Value),
    /// Nothing usable. Every rule resolves to empty against it.
    Empty,
}

impl Container {
    /// Classifies a response body.
    ///
    /// Bodies that look like JSON (leading `{` or `[`) and parse are JSON;
    /// anything else non-blank is markup. A body that looks like JSON but does
    /// not parse is still treated as markup so selector rules get a chance.
    pub fn from_body(body: &str) -> Self {
        let trimmed = body.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() {
            return Container::Empty;
        }

        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(json) = serde_json::from_str::<Value>(trimmed)
        {
            return Container::Json(json);
        }

        Container::Markup(body.to_string())
    }

    /// Turns one resolved list item into a sub-container.
    pub fn from_item(item: Value) -> Self {
        match item {
            Value::Null => Container::Empty,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    Container::from_body(&s)
                } else if trimmed.is_empty() {
                    Container::Empty
                } else {
                    Container::Markup(s)
                }
            }
            other => Container::Json(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Container::Empty)
    }

    /// JSON view of the container, used when binding it into a script.
    pub fn to_json(&self) -> Value {
        match self {
            Container::Markup(html) => Value::String(html.clone()),
            Container::Json(value) => value.clone(),
            Container::Empty => Value::Null,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Container::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Renders a resolved value as text. `Null` is the empty string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => value.to_string(),
    }
}

/// Whether a resolved value carries no data.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.iter().all(is_empty_value),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
