//! String templating for configuration values.
//!
//! Templates are plain strings with `{{ expression }}` substitutions. An
//! expression is a literal or a dotted name path, optionally piped through
//! filters: `{{ release.tag | b64decode | json }}`. Values resolve against a
//! [`Lookup`] (in practice the watch [`Context`](crate::context::Context)),
//! with the built-in `unixtime` name yielding the current epoch seconds.
//!
//! The final value of an expression is flattened to text with the rules:
//! null and undefined render empty, bytes decode as UTF-8 (lossy),
//! single-element lists collapse to their element, and empty containers
//! render empty.

use base64::Engine as _;
use thiserror::Error;

use crate::value::{render_plain, Value};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template syntax error at offset {pos}: {msg}")]
    Syntax { pos: usize, msg: String },

    #[error("unterminated '{{{{' expression")]
    Unterminated,

    #[error("block tag '{0}' is not supported in templates")]
    BlockTag(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("filter '{filter}': {msg}")]
    Filter { filter: String, msg: String },
}

/// Name resolution interface consulted by templates.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Lookup for indexmap::IndexMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Render a template string against a lookup.
pub fn render(template: &str, lookup: &dyn Lookup) -> Result<String, TemplateError> {
    let bytes = template.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let end = template[i + 2..]
                .find("}}")
                .ok_or(TemplateError::Unterminated)?;
            let expr_src = &template[i + 2..i + 2 + end];
            let value = eval_expression(expr_src, i + 2, lookup)?;
            out.push_str(&finalize(value.as_ref()));
            i += 2 + end + 2;
        } else if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'%' {
            let end = template[i + 2..].find("%}").map(|e| i + 2 + e + 2);
            let tag = match end {
                Some(e) => template[i..e].to_string(),
                None => template[i..].to_string(),
            };
            return Err(TemplateError::BlockTag(tag));
        } else {
            let ch = template[i..].chars().next().unwrap_or('\u{fffd}');
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Ok(out)
}

/// Flatten an evaluated expression result to substitution text.
pub fn finalize(value: Option<&Value>) -> String {
    let value = match value {
        None => return String::new(),
        Some(v) => v,
    };
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::List(items) => match items.len() {
            0 => String::new(),
            1 => finalize(Some(&items[0])),
            _ => render_plain(value),
        },
        Value::Items(items) => match items.len() {
            0 => String::new(),
            1 => String::from_utf8_lossy(items[0].value()).into_owned(),
            _ => render_plain(value),
        },
        Value::Map(map) => {
            if map.is_empty() {
                String::new()
            } else {
                render_plain(value)
            }
        }
    }
}

fn eval_expression(
    src: &str,
    offset: usize,
    lookup: &dyn Lookup,
) -> Result<Option<Value>, TemplateError> {
    let mut parser = Parser {
        src,
        pos: 0,
        offset,
        lookup,
    };
    let value = parser.expression()?;
    parser.skip_ws();
    if parser.pos < parser.src.len() {
        return Err(parser.error("trailing characters in expression"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    offset: usize,
    lookup: &'a dyn Lookup,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> TemplateError {
        TemplateError::Syntax {
            pos: self.offset + self.pos,
            msg: msg.to_string(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.rest().chars().next() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    /// expression := primary ('|' filter)*
    fn expression(&mut self) -> Result<Option<Value>, TemplateError> {
        let mut value = self.primary()?;
        while self.eat('|') {
            let name = self
                .ident()
                .ok_or_else(|| self.error("expected filter name after '|'"))?;
            let mut args = Vec::new();
            if self.eat('(') {
                if !self.eat(')') {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(')') {
                            break;
                        }
                        if !self.eat(',') {
                            return Err(self.error("expected ',' or ')' in filter arguments"));
                        }
                    }
                }
            }
            value = apply_filter(&name, value, &args)?;
        }
        Ok(value)
    }

    /// primary := string | integer | path
    fn primary(&mut self) -> Result<Option<Value>, TemplateError> {
        self.skip_ws();
        let rest = self.rest();
        match rest.chars().next() {
            Some(q @ ('\'' | '"')) => {
                let body = &rest[1..];
                let end = body
                    .find(q)
                    .ok_or_else(|| self.error("unterminated string literal"))?;
                let literal = body[..end].to_string();
                self.pos += 1 + end + 1;
                Ok(Some(Value::Str(literal)))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let len = rest
                    .char_indices()
                    .skip(1)
                    .find(|(_, c)| !c.is_ascii_digit())
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                let number: i64 = rest[..len]
                    .parse()
                    .map_err(|_| self.error("invalid integer literal"))?;
                self.pos += len;
                Ok(Some(Value::Int(number)))
            }
            Some(c) if c.is_alphabetic() || c == '_' => self.path(),
            _ => Err(self.error("expected a literal or name")),
        }
    }

    /// path := ident ('.' ident)*
    fn path(&mut self) -> Result<Option<Value>, TemplateError> {
        let name = self.ident().ok_or_else(|| self.error("expected name"))?;
        let mut value = match self.lookup.lookup(&name) {
            Some(v) => Some(v),
            None if name == "unixtime" => Some(Value::Int(chrono::Utc::now().timestamp())),
            None => None,
        };
        while self.rest().starts_with('.') {
            self.pos += 1;
            let attr = self
                .ident()
                .ok_or_else(|| self.error("expected name after '.'"))?;
            value = match value {
                Some(Value::Map(map)) => map.get(&attr).cloned(),
                _ => None,
            };
        }
        Ok(value)
    }

    fn ident(&mut self) -> Option<String> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(i, c)| {
                !(c.is_alphanumeric() || *c == '_' || (*i > 0 && *c == '-'))
            })
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 || rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return None;
        }
        let name = rest[..len].to_string();
        self.pos += len;
        Some(name)
    }
}

fn apply_filter(
    name: &str,
    input: Option<Value>,
    args: &[Option<Value>],
) -> Result<Option<Value>, TemplateError> {
    match name {
        "default" => {
            let fallback = args.first().cloned().flatten();
            match input {
                Some(v) => Ok(Some(v)),
                None => Ok(fallback),
            }
        }
        "json" => {
            let text = filter_text("json", input)?;
            let parsed: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| TemplateError::Filter {
                    filter: "json".to_string(),
                    msg: e.to_string(),
                })?;
            Ok(Some(Value::from_json(&parsed)))
        }
        "b64encode" => {
            let bytes = filter_bytes("b64encode", input)?;
            Ok(Some(Value::Str(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            )))
        }
        "b64decode" => {
            let text = filter_text("b64decode", input)?;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(text.trim().as_bytes())
                .map_err(|e| TemplateError::Filter {
                    filter: "b64decode".to_string(),
                    msg: e.to_string(),
                })?;
            Ok(Some(Value::Bytes(decoded)))
        }
        other => Err(TemplateError::UnknownFilter(other.to_string())),
    }
}

fn filter_text(filter: &str, input: Option<Value>) -> Result<String, TemplateError> {
    match input {
        Some(Value::Str(s)) => Ok(s),
        Some(Value::Bytes(b)) => Ok(String::from_utf8_lossy(&b).into_owned()),
        Some(other) => Err(TemplateError::Filter {
            filter: filter.to_string(),
            msg: format!("expected text, got {}", other.type_name()),
        }),
        None => Err(TemplateError::Filter {
            filter: filter.to_string(),
            msg: "input is undefined".to_string(),
        }),
    }
}

fn filter_bytes(filter: &str, input: Option<Value>) -> Result<Vec<u8>, TemplateError> {
    match input {
        Some(Value::Str(s)) => Ok(s.into_bytes()),
        Some(Value::Bytes(b)) => Ok(b),
        Some(other) => Err(TemplateError::Filter {
            filter: filter.to_string(),
            msg: format!("expected text or bytes, got {}", other.type_name()),
        }),
        None => Err(TemplateError::Filter {
            filter: filter.to_string(),
            msg: "input is undefined".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::item::Item;

    fn vars(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literal_passthrough() {
        let empty = IndexMap::new();
        assert_eq!(render("plain text", &empty).unwrap(), "plain text");
        assert_eq!(render("a { b } c", &empty).unwrap(), "a { b } c");
    }

    #[test]
    fn test_substitution_and_paths() {
        let mut release = Value::map();
        release.insert("tag".to_string(), Value::from("v1.2"));
        let ctx = vars(&[("name", Value::from("world")), ("release", Value::Map(release))]);
        assert_eq!(render("hi {{ name }}", &ctx).unwrap(), "hi world");
        assert_eq!(render("tag={{ release.tag }}", &ctx).unwrap(), "tag=v1.2");
        assert_eq!(render("missing={{ release.nope }}", &ctx).unwrap(), "missing=");
    }

    #[test]
    fn test_filters() {
        let ctx = vars(&[
            ("enc", Value::from("aGVsbG8=")),
            ("doc", Value::from(r#"{"k": "v"}"#)),
        ]);
        assert_eq!(render("{{ enc | b64decode }}", &ctx).unwrap(), "hello");
        assert_eq!(render("{{ 'hi' | b64encode }}", &ctx).unwrap(), "aGk=");
        assert_eq!(render("{{ doc | json }}", &ctx).unwrap(), "{\"k\": \"v\"}");
        assert_eq!(
            render("{{ missing | default('fallback') }}", &ctx).unwrap(),
            "fallback"
        );
        assert_eq!(
            render("{{ enc | default('fallback') }}", &ctx).unwrap(),
            "aGVsbG8="
        );
    }

    #[test]
    fn test_unknown_filter_is_error() {
        let empty = IndexMap::new();
        assert!(matches!(
            render("{{ x | upper }}", &empty),
            Err(TemplateError::UnknownFilter(_))
        ));
    }

    #[test]
    fn test_unixtime_builtin() {
        let empty = IndexMap::new();
        let rendered = render("{{ unixtime }}", &empty).unwrap();
        let secs: i64 = rendered.parse().unwrap();
        assert!(secs > 1_500_000_000);
    }

    #[test]
    fn test_finalize_rules() {
        assert_eq!(finalize(None), "");
        assert_eq!(finalize(Some(&Value::Null)), "");
        assert_eq!(finalize(Some(&Value::Bytes(b"abc".to_vec()))), "abc");
        assert_eq!(finalize(Some(&Value::List(vec![]))), "");
        assert_eq!(finalize(Some(&Value::List(vec![Value::Int(5)]))), "5");
        assert_eq!(
            finalize(Some(&Value::List(vec![Value::from("a"), Value::from("b")]))),
            "[\"a\", \"b\"]"
        );
        assert_eq!(finalize(Some(&Value::Map(Value::map()))), "");
        assert_eq!(
            finalize(Some(&Value::Items(vec![Item::new(&b"one"[..])]))),
            "one"
        );
    }

    #[test]
    fn test_block_tags_rejected() {
        let empty = IndexMap::new();
        assert!(matches!(
            render("{% if x %}y{% endif %}", &empty),
            Err(TemplateError::BlockTag(_))
        ));
    }

    #[test]
    fn test_unterminated_expression() {
        let empty = IndexMap::new();
        assert!(matches!(
            render("{{ name", &empty),
            Err(TemplateError::Unterminated)
        ));
    }
}
