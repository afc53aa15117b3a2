//! Selector-chain engine over markup.
//!
//! A chain is a sequence of `@`-separated tokens. Every token but the last
//! is a CSS compound selector applied to the matches of the previous token.
//! In field mode the last token of a multi-token chain names what to read
//! from the final matches; a single-token chain reads text content. A
//! leading `@` (`@href`, `@text`) reads from the item's own root element.
//!
//! List items are stored as outer HTML and re-parsed for their field rules.
//! Fragments that only parse inside a parent (`<tr>`, `<td>`, `<option>`)
//! are wrapped in that parent first, so their children survive.
//!
//! Besides plain CSS, tokens accept the `class.x`, `id.x` and `tag.x` forms
//! with an optional trailing index (`class.item.0`, `tag.li.-1`).

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;

use crate::rule::SelectorChain;

/// Evaluates a chain in field mode and returns a string value, or `Null`
/// when nothing matched.
pub fn select_field(html: &str, chain: &SelectorChain) -> Value {
    let (selectors, attribute) = match chain.tokens.split_last() {
        Some((last, rest)) if !rest.is_empty() => (rest, last.as_str()),
        _ => (chain.tokens.as_slice(), "text"),
    };

    let document = parse_markup(html);
    let Some(matches) = walk(&document, html, selectors) else {
        return Value::Null;
    };

    let value = read_attribute(&matches, attribute);
    if value.is_empty() { Value::Null } else { Value::String(value) }
}

/// Evaluates a chain in list mode: every token is a selector and each final
/// match yields its outer HTML.
pub fn select_nodes(html: &str, chain: &SelectorChain) -> Vec<String> {
    let document = parse_markup(html);
    walk(&document, html, &chain.tokens)
        .map(|matches| matches.iter().map(|el| el.html()).collect())
        .unwrap_or_default()
}

fn walk<'a>(document: &'a Html, html: &str, tokens: &[String]) -> Option<Vec<ElementRef<'a>>> {
    let mut current = vec![document.root_element()];

    for token in tokens {
        if token.is_empty() {
            current = vec![item_root(document, html)?];
            continue;
        }

        let (css, index) = translate_token(token);
        let selector = match Selector::parse(&css) {
            Ok(selector) => selector,
            Err(e) => {
                tracing::debug!(token = %token, error = %e, "invalid selector token");
                return None;
            }
        };

        let mut seen = HashSet::new();
        let mut next: Vec<ElementRef<'a>> = current
            .iter()
            .flat_map(|el| el.select(&selector))
            .filter(|el| seen.insert(el.id()))
            .collect();

        if let Some(index) = index {
            let len = next.len() as isize;
            let position = if index < 0 { len + index } else { index };
            next = if (0..len).contains(&position) { vec![next[position as usize]] } else { Vec::new() };
        }

        if next.is_empty() {
            return None;
        }
        current = next;
    }

    Some(current)
}

/// Parses markup, wrapping table and select fragments in the parent the
/// HTML parser requires.
fn parse_markup(html: &str) -> Html {
    let wrapped = match leading_tag(html).as_deref() {
        Some("tr") => format!("<table><tbody>{}</tbody></table>", html),
        Some("td" | "th") => format!("<table><tbody><tr>{}</tr></tbody></table>", html),
        Some("thead" | "tbody" | "tfoot" | "caption" | "colgroup") => format!("<table>{}</table>", html),
        Some("col") => format!("<table><colgroup>{}</colgroup></table>", html),
        Some("option" | "optgroup") => format!("<select>{}</select>", html),
        _ => return Html::parse_document(html),
    };
    Html::parse_document(&wrapped)
}

/// Lowercased name of the first tag in `html`, if it starts with one.
fn leading_tag(html: &str) -> Option<String> {
    let rest = html.trim_start().strip_prefix('<')?;
    let name: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
    if name.is_empty() { None } else { Some(name.to_ascii_lowercase()) }
}

/// The element a fragment starts with; the document root for anything else.
fn item_root<'a>(document: &'a Html, html: &str) -> Option<ElementRef<'a>> {
    match leading_tag(html) {
        Some(tag) => {
            let selector = Selector::parse(&tag).ok()?;
            document.select(&selector).next()
        }
        None => Some(document.root_element()),
    }
}

/// Translates `class.x`, `id.x`, `tag.x` tokens (with optional index) into CSS.
fn translate_token(token: &str) -> (String, Option<isize>) {
    let prefixed = [("class.", "."), ("id.", "#"), ("tag.", "")];

    for (prefix, css_prefix) in prefixed {
        if let Some(rest) = token.strip_prefix(prefix) {
            let mut parts = rest.splitn(2, '.');
            let name = parts.next().unwrap_or_default();
            let index = parts.next().and_then(|i| i.parse::<isize>().ok());
            let css = if prefix == "class." {
                name.split_whitespace().map(|c| format!(".{}", c)).collect::<String>()
            } else {
                format!("{}{}", css_prefix, name)
            };
            return (css, index);
        }
    }

    (token.to_string(), None)
}

fn read_attribute(matches: &[ElementRef<'_>], attribute: &str) -> String {
    let joined = |values: Vec<String>| {
        values.into_iter().filter(|v| !v.trim().is_empty()).collect::<Vec<_>>().join("\n")
    };

    match attribute {
        "text" => joined(matches.iter().map(|el| collapse_whitespace(&el.text().collect::<String>())).collect()),
        "textNodes" => joined(matches.iter().map(|el| own_text(el, "\n")).collect()),
        "ownText" => joined(matches.iter().map(|el| own_text(el, " ")).collect()),
        "html" => joined(matches.iter().map(|el| el.inner_html()).collect()),
        "outerHtml" | "all" => joined(matches.iter().map(|el| el.html()).collect()),
        name => matches
            .iter()
            .filter_map(|el| el.value().attr(name))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .unwrap_or_default(),
    }
}

fn own_text(el: &ElementRef<'_>, separator: &str) -> String {
    el.children()
        .filter_map(|child| child.value().as_text().map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
