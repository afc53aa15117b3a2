//! List extraction: a root list rule plus per-field rules build an ordered,
//! de-duplicated sequence of [`Entity`] records.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::request::join_url;
use crate::resolve::{EvaluationContext, resolve_field, resolve_list};
use crate::rule::Rule;
use crate::value::Container;

/// One extracted record, e.g. a chapter. Reading order is list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub intro: String,
}

/// Per-entity field rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldRules<'a> {
    pub title: Option<&'a Rule>,
    pub url: Option<&'a Rule>,
    pub intro: Option<&'a Rule>,
}

/// Resolves `list_rule` into sub-containers and assembles one entity from
/// each.
///
/// When the list rule yields nothing and the container is JSON carrying a
/// top-level array (directly, or under `data`), that array is used instead,
/// with only the title and url rules applied. Entities without a title or url
/// are dropped; relative urls are joined against `base_url`; the first entity
/// wins for each url. Order is never changed.
pub fn extract_list(
    container: &Container, list_rule: Option<&Rule>, fields: FieldRules<'_>, base_url: Option<&str>,
    ctx: &EvaluationContext,
) -> Vec<Entity> {
    let mut entities = match list_rule {
        Some(rule) => match resolve_list(rule, container, ctx) {
            Ok(items) => build(&items, fields, ctx),
            Err(e) => {
                tracing::warn!(source = %ctx.source().id, error = %e, "list rule failed; trying top-level array");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    if entities.is_empty()
        && let Some(items) = top_level_array(container)
    {
        tracing::debug!(source = %ctx.source().id, count = items.len(), "using top-level JSON array as list");
        let fallback = FieldRules { intro: None, ..fields };
        entities = build(&items, fallback, ctx);
    }

    finish(entities, base_url)
}

fn build(items: &[Container], fields: FieldRules<'_>, ctx: &EvaluationContext) -> Vec<Entity> {
    items
        .iter()
        .map(|item| Entity {
            title: resolve_field(fields.title, item, ctx, "title"),
            url: resolve_field(fields.url, item, ctx, "url"),
            intro: resolve_field(fields.intro, item, ctx, "intro"),
        })
        .collect()
}

fn finish(entities: Vec<Entity>, base_url: Option<&str>) -> Vec<Entity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|entity| !entity.title.trim().is_empty() && !entity.url.trim().is_empty())
        .map(|mut entity| {
            entity.title = entity.title.trim().to_string();
            entity.url = match base_url {
                Some(base) => join_url(&entity.url, base),
                None => entity.url.trim().to_string(),
            };
            entity
        })
        .filter(|entity| seen.insert(entity.url.trim().to_string()))
        .collect()
}

/// An array of objects at the top level of a JSON container, or under a
/// top-level `data` object.
fn top_level_array(container: &Container) -> Option<Vec<Container>> {
    let json = container.as_json()?;
    let candidates: Vec<&Value> = match json {
        Value::Array(_) => vec![json],
        Value::Object(map) => {
            let nested = map.get("data").and_then(Value::as_object).into_iter().flat_map(|data| data.values());
            map.values().chain(nested).collect()
        }
        _ => Vec::new(),
    };

    candidates.into_iter().find_map(|candidate| match candidate {
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            Some(items.iter().cloned().map(Container::Json).collect())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptHost;
    use crate::source::SourceDefinition;
    use crate::store::Stores;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> EvaluationContext {
        let source = SourceDefinition::from_json(r#"{"id": "t"}"#).unwrap();
        EvaluationContext::new(Arc::new(source), Stores::default(), ScriptHost::default())
    }

    fn rule(raw: &str) -> Rule {
        Rule::parse(raw).unwrap()
    }

    const TOC: &str = r#"<ul id="toc">
        <li><a href="/c/1">Chapter 1</a></li>
        <li><a href="/c/2">Chapter 2</a></li>
        <li><a href="/c/1">Chapter 1 (again)</a></li>
        <li><a href="">Broken</a></li>
        <li><a href="/c/3"> </a></li>
        <li><a href="/c/4">Chapter 4</a></li>
    </ul>"#;

    #[test]
    fn test_extract_markup_list() {
        let (list, title, url) = (rule("ul#toc@li"), rule("a@text"), rule("a@href"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };
        let entities =
            extract_list(&Container::Markup(TOC.to_string()), Some(&list), fields, Some("https://h/book/1"), &ctx());

        let urls: Vec<&str> = entities.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["https://h/c/1", "https://h/c/2", "https://h/c/4"]);
        assert_eq!(entities[0].title, "Chapter 1");
    }

    #[test]
    fn test_extract_table_rows() {
        let toc = r#"<table class="chapters">
            <tr><td class="name"><a href="/c/1">Chapter 1</a></td><td>2024-03-01</td></tr>
            <tr><td class="name"><a href="/c/2">Chapter 2</a></td><td>2024-03-02</td></tr>
        </table>"#;
        let (list, title, url, intro) = (rule("table.chapters@tr"), rule("td.name@text"), rule("a@href"), rule("tag.td.1@text"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: Some(&intro) };
        let entities =
            extract_list(&Container::Markup(toc.to_string()), Some(&list), fields, Some("https://h/book/1"), &ctx());

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[1].title, "Chapter 2");
        assert_eq!(entities[1].url, "https://h/c/2");
        assert_eq!(entities[0].intro, "2024-03-01");
    }

    #[test]
    fn test_item_root_attribute() {
        let toc = r#"<div class="toc"><a href="/c/1">One</a><a href="/c/2">Two</a></div>"#;
        let (list, title, url) = (rule("div.toc@a"), rule("@text"), rule("@href"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };
        let entities = extract_list(&Container::Markup(toc.to_string()), Some(&list), fields, None, &ctx());

        let urls: Vec<&str> = entities.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["/c/1", "/c/2"]);
        assert_eq!(entities[0].title, "One");
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let (list, title, url) = (rule("ul#toc@li"), rule("a@text"), rule("a@href"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };
        let container = Container::Markup(TOC.to_string());
        let ctx = ctx();

        let first = extract_list(&container, Some(&list), fields, None, &ctx);
        let second = extract_list(&container, Some(&list), fields, None, &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn test_json_list_with_intro() {
        let container = Container::Json(json!({"data": {"list": [
            {"name": "A", "id": "a", "desc": "first"},
            {"name": "B", "id": "b"}
        ]}}));
        let (list, title, url, intro) = (rule("$.data.list"), rule("$.name"), rule("$.id"), rule("$.desc"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: Some(&intro) };

        let entities = extract_list(&container, Some(&list), fields, Some("https://h/api/"), &ctx());
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].url, "https://h/api/a");
        assert_eq!(entities[0].intro, "first");
        assert_eq!(entities[1].intro, "");
    }

    #[test]
    fn test_fallback_to_top_level_array() {
        let container = Container::Json(json!({"code": 0, "chapters": [
            {"title": "One", "url": "https://h/1"},
            {"title": "Two", "url": "https://h/2"}
        ]}));
        let (list, title, url) = (rule("$.missing"), rule("$.title"), rule("$.url"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };

        let entities = extract_list(&container, Some(&list), fields, None, &ctx());
        assert_eq!(entities.iter().map(|e| e.title.as_str()).collect::<Vec<_>>(), vec!["One", "Two"]);
    }

    #[test]
    fn test_throwing_list_rule_falls_back() {
        let container = Container::Json(json!([{"title": "Only", "url": "/only"}]));
        let (list, title, url) = (rule("@js:throw new Error('nope')"), rule("$.title"), rule("$.url"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };

        let entities = extract_list(&container, Some(&list), fields, Some("https://h/"), &ctx());
        assert_eq!(entities, vec![Entity { title: "Only".into(), url: "https://h/only".into(), intro: String::new() }]);
    }

    #[test]
    fn test_empty_container_yields_nothing() {
        let (list, title, url) = (rule("li"), rule("a"), rule("a@href"));
        let fields = FieldRules { title: Some(&title), url: Some(&url), intro: None };
        assert!(extract_list(&Container::Empty, Some(&list), fields, None, &ctx()).is_empty());
    }
}
