//! Byte- and list-level transforms: slicing, splitting, joining, trimming,
//! tag stripping, regex replacement, and entity decoding.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use super::{Selector, SelectorCore, SelectorError, SelectorResult};
use crate::item::Item;
use crate::registry::{LoadError, LoadResult, Node};
use crate::runtime::Runtime;

/// Resolve start/end offsets the way list slicing conventionally works:
/// negative offsets count from the end, out-of-range offsets clamp.
fn slice_bounds(len: usize, start: i64, end: Option<i64>) -> (usize, usize) {
    let resolve = |offset: i64| -> usize {
        if offset < 0 {
            len.saturating_sub(offset.unsigned_abs() as usize)
        } else {
            (offset as usize).min(len)
        }
    };
    let lo = resolve(start);
    let hi = match end {
        None => len,
        Some(e) => resolve(e),
    };
    (lo, hi.max(lo))
}

pub struct BytesSelector {
    core: SelectorCore,
    start: i64,
    end: Option<i64>,
}

pub fn build_bytes(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(BytesSelector {
        start: node.take_int("start"),
        end: node.take_opt_int("end"),
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for BytesSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let (lo, hi) = slice_bounds(item.value().len(), self.start, self.end);
        Ok(vec![item.with_value(item.value()[lo..hi].to_vec())])
    }
}

pub struct LinesSelector {
    core: SelectorCore,
    keepends: bool,
    html: bool,
}

pub fn build_lines(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(LinesSelector {
        keepends: node.take_bool("keepends"),
        html: node.take_bool("html"),
        core: SelectorCore::from_node(&mut node),
    }))
}

static HTML_BREAKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>").expect("static pattern"));

impl Selector for LinesSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let value;
        let data: &[u8] = if self.html {
            value = HTML_BREAKS.replace_all(item.value(), &b"\n"[..]).into_owned();
            &value
        } else {
            item.value()
        };

        let mut out = Vec::new();
        let mut line_start = 0;
        let mut i = 0;
        while i < data.len() {
            let terminator = match data[i] {
                b'\n' => 1,
                b'\r' if data.get(i + 1) == Some(&b'\n') => 2,
                b'\r' => 1,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let end = if self.keepends { i + terminator } else { i };
            out.push(item.with_value(data[line_start..end].to_vec()));
            i += terminator;
            line_start = i;
        }
        if line_start < data.len() {
            out.push(item.with_value(data[line_start..].to_vec()));
        }
        Ok(out)
    }
}

pub struct SplitSelector {
    core: SelectorCore,
    sep: Vec<u8>,
    start: i64,
    end: Option<i64>,
}

pub fn build_split(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let sep = node.take_str("sep").into_bytes();
    if sep.is_empty() {
        return Err(LoadError::Invalid {
            kind: node.kind,
            msg: "split separator must not be empty".to_string(),
        });
    }
    Ok(Box::new(SplitSelector {
        sep,
        start: node.take_int("start"),
        end: node.take_opt_int("end"),
        core: SelectorCore::from_node(&mut node),
    }))
}

fn split_bytes<'a>(data: &'a [u8], sep: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + sep.len() <= data.len() {
        if &data[i..i + sep.len()] == sep {
            parts.push(&data[start..i]);
            i += sep.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&data[start..]);
    parts
}

impl Selector for SplitSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let parts = split_bytes(item.value(), &self.sep);
        let (lo, hi) = slice_bounds(parts.len(), self.start, self.end);
        Ok(parts[lo..hi]
            .iter()
            .map(|p| item.with_value(p.to_vec()))
            .collect())
    }
}

pub struct JoinSelector {
    core: SelectorCore,
    sep: Vec<u8>,
}

pub fn build_join(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(JoinSelector {
        sep: node.take_str("sep").into_bytes(),
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for JoinSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run_all(&self, _rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let first = match items.first() {
            None => return Ok(Vec::new()),
            Some(first) => first,
        };
        let joined = items
            .iter()
            .map(Item::value)
            .collect::<Vec<&[u8]>>()
            .join(self.sep.as_slice());
        Ok(vec![first.with_value(joined)])
    }
}

pub struct StripSelector {
    core: SelectorCore,
    chars: Vec<u8>,
}

pub fn build_strip(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let mut chars = node.take_str("chars").into_bytes();
    if chars.is_empty() {
        chars = b"\r\n\t ".to_vec();
    }
    Ok(Box::new(StripSelector {
        chars,
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for StripSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let data = item.value();
        let lo = data
            .iter()
            .position(|b| !self.chars.contains(b))
            .unwrap_or(data.len());
        let hi = data
            .iter()
            .rposition(|b| !self.chars.contains(b))
            .map(|i| i + 1)
            .unwrap_or(lo);
        Ok(vec![item.with_value(data[lo..hi].to_vec())])
    }
}

pub struct StripTagsSelector {
    core: SelectorCore,
    replacement: Vec<u8>,
}

pub fn build_striptags(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(StripTagsSelector {
        replacement: node.take_str("replacement").into_bytes(),
        core: SelectorCore::from_node(&mut node),
    }))
}

static TAG_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:<[^>]*>)+").expect("static pattern"));

impl Selector for StripTagsSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let replaced = TAG_RUN
            .replace_all(item.value(), self.replacement.as_slice())
            .into_owned();
        Ok(vec![item.with_value(replaced)])
    }
}

pub struct ReplaceSelector {
    core: SelectorCore,
    regex: Regex,
    replacement: Vec<u8>,
}

pub fn build_replace(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let pattern = node.take_str("regex");
    let regex = Regex::new(&pattern).map_err(|e| LoadError::Invalid {
        kind: node.kind,
        msg: format!("invalid regex '{}': {}", pattern, e),
    })?;
    Ok(Box::new(ReplaceSelector {
        regex,
        replacement: backrefs(&node.take_str("replacement")),
        core: SelectorCore::from_node(&mut node),
    }))
}

/// Rewrite `\1`-style backreferences to the `${1}` form the regex engine
/// expects, so existing configurations keep working.
fn backrefs(replacement: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                chars.next();
                out.extend_from_slice(format!("${{{}}}", d).as_bytes());
                continue;
            }
        }
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    out
}

impl Selector for ReplaceSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let replaced = self
            .regex
            .replace_all(item.value(), self.replacement.as_slice())
            .into_owned();
        Ok(vec![item.with_value(replaced)])
    }
}

pub struct SliceSelector {
    core: SelectorCore,
    start: i64,
    end: Option<i64>,
}

pub fn build_slice(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(SliceSelector {
        start: node.take_int("start"),
        end: node.take_opt_int("end"),
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for SliceSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run_all(&self, _rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let (lo, hi) = slice_bounds(items.len(), self.start, self.end);
        Ok(items[lo..hi].to_vec())
    }
}

pub struct PickSelector {
    core: SelectorCore,
    index: Vec<i64>,
}

pub fn build_pick(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let index: Option<Vec<i64>> = node
        .take_list("index")
        .iter()
        .map(|v| match v {
            crate::value::Value::Int(i) => Some(*i),
            crate::value::Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect();
    let index = index.ok_or_else(|| LoadError::Invalid {
        kind: node.kind,
        msg: "pick indices must be integers".to_string(),
    })?;
    Ok(Box::new(PickSelector {
        index,
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for PickSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run_all(&self, _rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let mut out = Vec::new();
        for &idx in &self.index {
            let resolved = if idx < 0 {
                items.len().checked_sub(idx.unsigned_abs() as usize)
            } else {
                Some(idx as usize)
            };
            if let Some(item) = resolved.and_then(|i| items.get(i)) {
                out.push(item.clone());
            }
        }
        Ok(out)
    }
}

pub struct DecodeSelector {
    core: SelectorCore,
}

pub fn build_decode(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    // `encoding` is validated by the schema; html entities are the only
    // supported codec.
    node.take("encoding");
    Ok(Box::new(DecodeSelector {
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for DecodeSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let text = String::from_utf8_lossy(item.value());
        let decoded = htmlescape::decode_html(&text)
            .map_err(|e| SelectorError::Decode(format!("{:?}", e)))?;
        Ok(vec![item.with_value(decoded.into_bytes())])
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::execute;
    use super::*;

    fn values(items: &[Item]) -> Vec<Vec<u8>> {
        items.iter().map(|i| i.value().to_vec()).collect()
    }

    #[test]
    fn test_bytes_slice() {
        with_runtime(|rt| {
            let s = load("bytes: 4\n");
            let out = execute(s.as_ref(), rt, items(&[b"abcdefgh"])).unwrap();
            assert_eq!(values(&out), [b"abcd".to_vec()]);

            let s = load("type: bytes\nstart: -3\n");
            let out = execute(s.as_ref(), rt, items(&[b"abcdefgh"])).unwrap();
            assert_eq!(values(&out), [b"fgh".to_vec()]);
        });
    }

    #[test]
    fn test_lines_split() {
        with_runtime(|rt| {
            let s = load("type: lines\n");
            let out = execute(s.as_ref(), rt, items(&[b"one\ntwo\r\nthree"])).unwrap();
            assert_eq!(values(&out), [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

            let s = load("type: lines\nkeepends: true\n");
            let out = execute(s.as_ref(), rt, items(&[b"one\ntwo"])).unwrap();
            assert_eq!(values(&out), [b"one\n".to_vec(), b"two".to_vec()]);
        });
    }

    #[test]
    fn test_lines_html_breaks() {
        with_runtime(|rt| {
            let s = load("type: lines\nhtml: true\n");
            let out = execute(s.as_ref(), rt, items(&[b"a<br/>b<BR>c</p>d"])).unwrap();
            assert_eq!(
                values(&out),
                [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
            );
        });
    }

    #[test]
    fn test_split_and_bounds() {
        with_runtime(|rt| {
            let s = load("split: ','\n");
            let out = execute(s.as_ref(), rt, items(&[b"a,b,c"])).unwrap();
            assert_eq!(values(&out), [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

            let s = load("split: ','\nstart: 1\nend: -1\n");
            let out = execute(s.as_ref(), rt, items(&[b"a,b,c,d"])).unwrap();
            assert_eq!(values(&out), [b"b".to_vec(), b"c".to_vec()]);
        });
    }

    #[test]
    fn test_join() {
        with_runtime(|rt| {
            let s = load("join: '-'\n");
            let out = execute(s.as_ref(), rt, items(&[b"a", b"b", b"c"])).unwrap();
            assert_eq!(values(&out), [b"a-b-c".to_vec()]);
            assert!(execute(s.as_ref(), rt, Vec::new()).unwrap().is_empty());
        });
    }

    #[test]
    fn test_strip() {
        with_runtime(|rt| {
            let s = load("strip: ''\n");
            let out = execute(s.as_ref(), rt, items(&[b"  hello\r\n"])).unwrap();
            assert_eq!(values(&out), [b"hello".to_vec()]);

            let s = load("strip: 'x'\n");
            let out = execute(s.as_ref(), rt, items(&[b"xxhixx"])).unwrap();
            assert_eq!(values(&out), [b"hi".to_vec()]);
        });
    }

    #[test]
    fn test_striptags_collapses_runs() {
        with_runtime(|rt| {
            let s = load("type: striptags\nreplacement: ' '\n");
            let out = execute(s.as_ref(), rt, items(&[b"<p><b>bold</b> text</p>"])).unwrap();
            assert_eq!(values(&out), [b" bold text ".to_vec()]);
        });
    }

    #[test]
    fn test_replace_with_backref() {
        with_runtime(|rt| {
            let s = load("replace: '.*(AAbbCC).*'\nreplacement: 'https://example.com/\\1'\n");
            let out = execute(s.as_ref(), rt, items(&[b"xxAAbbCCxx"])).unwrap();
            assert_eq!(values(&out), [b"https://example.com/AAbbCC".to_vec()]);
        });
    }

    #[test]
    fn test_slice_and_pick() {
        with_runtime(|rt| {
            let s = load("type: slice\nstart: 1\nend: 3\n");
            let out = execute(s.as_ref(), rt, items(&[b"a", b"b", b"c", b"d"])).unwrap();
            assert_eq!(values(&out), [b"b".to_vec(), b"c".to_vec()]);

            let s = load("pick: [0, -1]\n");
            let out = execute(s.as_ref(), rt, items(&[b"a", b"b", b"c"])).unwrap();
            assert_eq!(values(&out), [b"a".to_vec(), b"c".to_vec()]);
        });
    }

    #[test]
    fn test_decode_html_entities() {
        with_runtime(|rt| {
            let s = load("type: decode\n");
            let out = execute(s.as_ref(), rt, items(&[b"a &amp; b &lt;ok&gt;"])).unwrap();
            assert_eq!(values(&out), [b"a & b <ok>".to_vec()]);
        });
    }

    #[test]
    fn test_empty_results_dropped() {
        with_runtime(|rt| {
            let s = load("strip: 'x'\n");
            let out = execute(s.as_ref(), rt, items(&[b"xx", b"ay"])).unwrap();
            assert_eq!(values(&out), [b"ay".to_vec()]);
        });
    }
}
