//! Rule value resolution.
//!
//! [`resolve`] evaluates one classified [`Rule`] against a [`Container`].
//! Selector and JSON-path misses resolve to `Null`; only the script host can
//! fail, with [`QuireError::ScriptError`], and callers decide whether a field
//! has a fallback.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::rule::{JsonPath, Rule, SelectorChain};
use crate::script::{ScriptCapabilities, ScriptHost, ScriptInput};
use crate::selector::{select_field, select_nodes};
use crate::source::SourceDefinition;
use crate::store::Stores;
use crate::value::{Container, is_empty_value, value_to_text};
use crate::Result;

/// Everything a rule may see besides its container.
///
/// One context lives for one pipeline run. Shared variables written by a
/// script are visible to every later script in the same run, including runs
/// made through clones of the context, and are dropped with the last clone.
#[derive(Clone)]
pub struct EvaluationContext {
    source: Arc<SourceDefinition>,
    base_url: Option<String>,
    shared: Arc<Mutex<Map<String, Value>>>,
    extra: Map<String, Value>,
    stores: Stores,
    host: ScriptHost,
}

impl EvaluationContext {
    pub fn new(source: Arc<SourceDefinition>, stores: Stores, host: ScriptHost) -> Self {
        Self { source, base_url: None, shared: Arc::new(Mutex::new(Map::new())), extra: Map::new(), stores, host }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Binds additional globals for scripts, e.g. a pseudo-URL's JSON context.
    /// Object contexts are spread into individual globals; anything else is
    /// bound as `context`.
    pub fn with_context(mut self, context: Value) -> Self {
        self.add_context(context);
        self
    }

    pub fn add_context(&mut self, context: Value) {
        match context {
            Value::Object(map) => self.extra.extend(map),
            Value::Null => {}
            other => {
                self.extra.insert("context".to_string(), other);
            }
        }
    }

    pub fn source(&self) -> &SourceDefinition {
        &self.source
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn shared_variables(&self) -> Map<String, Value> {
        self.shared.lock().map(|shared| shared.clone()).unwrap_or_default()
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn capabilities(&self) -> ScriptCapabilities {
        ScriptCapabilities {
            source_id: self.source.id.clone(),
            source_name: self.source.display_name().to_string(),
            variable_key: self.source.variable_key(),
            hosts: self.source.hosts().to_vec(),
            base_url: self.base_url.clone(),
            auth: Arc::clone(&self.stores.auth),
            variables: Arc::clone(&self.stores.variables),
            cache: Arc::clone(&self.stores.cache),
        }
    }

    fn input(&self, result: Value) -> ScriptInput {
        ScriptInput { result, shared: self.shared_variables(), extra: self.extra.clone() }
    }

    /// Runs a script body with `result` bound, carrying shared variables
    /// across runs.
    pub fn run_script(&self, body: &str, result: Value) -> Result<Value> {
        let output = self.host.run(body, self.input(result), self.capabilities())?;
        if let Ok(mut shared) = self.shared.lock() {
            *shared = output.shared;
        }
        Ok(output.value)
    }

    /// Runs a script body once per item, see [`ScriptHost::run_each`].
    pub fn run_script_each(&self, body: &str, item_name: &str, items: &[Value]) -> Result<Vec<Value>> {
        self.host.run_each(body, item_name, items, self.input(Value::Null), self.capabilities())
    }
}

/// Evaluates `rule` against `container`.
pub fn resolve(rule: &Rule, container: &Container, ctx: &EvaluationContext) -> Result<Value> {
    match rule {
        Rule::Script(body) => ctx.run_script(body, container.to_json()),
        Rule::JsonPath(paths) => Ok(first_non_empty(paths.iter().map(|path| json_path(container, path)))),
        Rule::Hybrid { base, script } => {
            let intermediate = resolve(base, container, ctx)?;
            ctx.run_script(script, intermediate)
        }
        Rule::Selector(chains) => Ok(first_non_empty(chains.iter().map(|chain| selector(container, chain)))),
    }
}

/// Evaluates `rule` and renders the value as trimmed text.
pub fn resolve_text(rule: &Rule, container: &Container, ctx: &EvaluationContext) -> Result<String> {
    resolve(rule, container, ctx).map(|value| value_to_text(&value).trim().to_string())
}

/// Like [`resolve_text`], but a script failure is logged and yields an empty
/// string so the caller's fallback applies. A missing rule is empty too.
pub fn resolve_field(rule: Option<&Rule>, container: &Container, ctx: &EvaluationContext, field: &str) -> String {
    let Some(rule) = rule else {
        return String::new();
    };
    match resolve_text(rule, container, ctx) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(source = %ctx.source().id, field, error = %e, "rule failed; using fallback");
            String::new()
        }
    }
}

/// Evaluates `rule` in list mode and returns one sub-container per item.
pub fn resolve_list(rule: &Rule, container: &Container, ctx: &EvaluationContext) -> Result<Vec<Container>> {
    if container.is_empty() && !rule.is_script() {
        return Ok(Vec::new());
    }

    let items = match rule {
        Rule::Selector(chains) => chains
            .iter()
            .map(|chain| list_items(container, chain))
            .find(|items| !items.is_empty())
            .unwrap_or_default(),
        Rule::JsonPath(paths) => {
            let value = first_non_empty(paths.iter().map(|path| json_path(container, path)));
            split_items(value)
        }
        Rule::Script(body) => split_items(ctx.run_script(body, container.to_json())?),
        Rule::Hybrid { base, script } => {
            let intermediate: Vec<Value> = resolve_list(base, container, ctx)?.iter().map(Container::to_json).collect();
            split_items(ctx.run_script(script, Value::Array(intermediate))?)
        }
    };

    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}

fn first_non_empty(mut candidates: impl Iterator<Item = Value>) -> Value {
    candidates.find(|candidate| !is_empty_value(candidate)).unwrap_or(Value::Null)
}

fn json_path(container: &Container, path: &JsonPath) -> Value {
    let Some(root) = container.as_json() else {
        return Value::Null;
    };

    let mut current = root.clone();
    for key in &path.keys {
        current = lookup(&current, key);
        if current.is_null() {
            break;
        }
    }
    current
}

/// One step of a JSON path. Numeric keys index arrays; other keys map over
/// array elements.
fn lookup(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        Value::Array(items) => match key.parse::<usize>() {
            Ok(index) => items.get(index).cloned().unwrap_or(Value::Null),
            Err(_) => {
                let mapped: Vec<Value> = items.iter().map(|item| lookup(item, key)).filter(|v| !v.is_null()).collect();
                if mapped.is_empty() { Value::Null } else { Value::Array(mapped) }
            }
        },
        _ => Value::Null,
    }
}

fn selector(container: &Container, chain: &SelectorChain) -> Value {
    match container {
        Container::Markup(html) => select_field(html, chain),
        Container::Json(json) => json_key(json, chain),
        Container::Empty => Value::Null,
    }
}

/// A selector rule against JSON reads one top-level key.
fn json_key(json: &Value, chain: &SelectorChain) -> Value {
    match chain.tokens.iter().find(|token| !token.is_empty()) {
        Some(key) => lookup(json, key),
        None => Value::Null,
    }
}

fn list_items(container: &Container, chain: &SelectorChain) -> Vec<Container> {
    match container {
        Container::Markup(html) => select_nodes(html, chain).into_iter().map(Container::Markup).collect(),
        Container::Json(json) => split_items(json_key(json, chain)),
        Container::Empty => Vec::new(),
    }
}

fn split_items(value: Value) -> Vec<Container> {
    match value {
        Value::Array(items) => items.into_iter().map(Container::from_item).collect(),
        Value::String(text) => match Container::from_body(&text) {
            Container::Json(Value::Array(items)) => items.into_iter().map(Container::from_item).collect(),
            Container::Empty => Vec::new(),
            other => vec![other],
        },
        Value::Null => Vec::new(),
        other => vec![Container::Json(other)],
    }
}
