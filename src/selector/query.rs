//! Structured-document selectors: JSON path programs and CSS queries over
//! HTML/XML markup.

use super::{Selector, SelectorCore, SelectorError, SelectorResult};
use crate::item::Item;
use crate::registry::{LoadError, LoadResult, Node};
use crate::runtime::Runtime;

pub struct JqSelector {
    core: SelectorCore,
    program: String,
}

pub fn build_jq(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let core = SelectorCore::from_node(&mut node);
    let program = core.value.clone().ok_or(LoadError::MissingField {
        kind: node.kind,
        field: "value".to_string(),
    })?;
    Ok(Box::new(JqSelector { core, program }))
}

impl Selector for JqSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let json: serde_json::Value = serde_json::from_slice(item.value())?;
        let matches = jsonpath_lib::select(&json, &self.program)
            .map_err(|e| SelectorError::JsonPath(format!("{:?}", e)))?;

        let mut out = Vec::new();
        for matched in matches {
            // String results pass through as text; anything else re-serializes
            // as JSON.
            let bytes = match matched {
                serde_json::Value::String(s) => s.clone().into_bytes(),
                other => serde_json::to_vec(other)?,
            };
            out.push(item.with_value(bytes));
        }
        Ok(out)
    }
}

enum MarkupMode {
    Document,
    Fragment,
}

pub struct MarkupSelector {
    core: SelectorCore,
    query: scraper::Selector,
    mode: MarkupMode,
}

fn build_markup(mut node: Node, mode: MarkupMode) -> LoadResult<Box<dyn Selector>> {
    let core = SelectorCore::from_node(&mut node);
    let source = core.value.clone().ok_or(LoadError::MissingField {
        kind: node.kind,
        field: "value".to_string(),
    })?;
    let query = scraper::Selector::parse(&source).map_err(|e| LoadError::Invalid {
        kind: node.kind,
        msg: format!("invalid CSS selector '{}': {}", source, e),
    })?;
    Ok(Box::new(MarkupSelector { core, query, mode }))
}

pub fn build_html(node: Node) -> LoadResult<Box<dyn Selector>> {
    build_markup(node, MarkupMode::Document)
}

pub fn build_xml(node: Node) -> LoadResult<Box<dyn Selector>> {
    build_markup(node, MarkupMode::Fragment)
}

impl Selector for MarkupSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let text = String::from_utf8_lossy(item.value());
        let doc = match self.mode {
            MarkupMode::Document => scraper::Html::parse_document(&text),
            MarkupMode::Fragment => scraper::Html::parse_fragment(&text),
        };
        Ok(doc
            .select(&self.query)
            .map(|element| item.with_value(element.html().into_bytes()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::execute;
    use super::super::test_support::*;

    fn values(items: &[crate::item::Item]) -> Vec<String> {
        items
            .iter()
            .map(|i| String::from_utf8_lossy(i.value()).into_owned())
            .collect()
    }

    #[test]
    fn test_jq_string_results() {
        with_runtime(|rt| {
            let s = load("jq: '$.releases[*].tag'\n");
            let doc = br#"{"releases": [{"tag": "v1"}, {"tag": "v2"}]}"#;
            let out = execute(s.as_ref(), rt, items(&[doc])).unwrap();
            assert_eq!(values(&out), ["v1", "v2"]);
        });
    }

    #[test]
    fn test_jq_structured_results_reserialize() {
        with_runtime(|rt| {
            let s = load("jq: '$.releases[0]'\n");
            let doc = br#"{"releases": [{"tag": "v1"}]}"#;
            let out = execute(s.as_ref(), rt, items(&[doc])).unwrap();
            assert_eq!(values(&out), [r#"{"tag":"v1"}"#]);
        });
    }

    #[test]
    fn test_jq_invalid_json_is_error() {
        with_runtime(|rt| {
            let s = load("jq: '$.x'\n");
            assert!(execute(s.as_ref(), rt, items(&[b"not json"])).is_err());
        });
    }

    #[test]
    fn test_html_css_query() {
        with_runtime(|rt| {
            let s = load("html: 'ul li.item'\n");
            let doc = b"<html><body><ul><li class=\"item\">one</li><li>skip</li>\
                        <li class=\"item\">two</li></ul></body></html>";
            let out = execute(s.as_ref(), rt, items(&[doc])).unwrap();
            assert_eq!(
                values(&out),
                ["<li class=\"item\">one</li>", "<li class=\"item\">two</li>"]
            );
        });
    }

    #[test]
    fn test_xml_fragment_query() {
        with_runtime(|rt| {
            let s = load("xml: 'entry > title'\n");
            let doc = b"<feed><entry><title>first</title></entry>\
                        <entry><title>second</title></entry></feed>";
            let out = execute(s.as_ref(), rt, items(&[doc])).unwrap();
            assert_eq!(values(&out), ["<title>first</title>", "<title>second</title>"]);
        });
    }
}
