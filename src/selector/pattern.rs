//! Regex extraction over raw item bytes.

use regex::bytes::Regex;

use super::{Selector, SelectorCore, SelectorResult};
use crate::item::Item;
use crate::registry::{LoadError, LoadResult, Node};
use crate::runtime::Runtime;

pub struct RegexSelector {
    core: SelectorCore,
    regex: Regex,
    all: bool,
}

pub fn build_regex(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let pattern = node.take_str("regex");
    let regex = Regex::new(&pattern).map_err(|e| LoadError::Invalid {
        kind: node.kind,
        msg: format!("invalid regex '{}': {}", pattern, e),
    })?;
    Ok(Box::new(RegexSelector {
        regex,
        all: node.take_bool("all"),
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for RegexSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    /// Emission per match: with named groups, one item whose value is the
    /// whole match and whose vars overlay the groups; with unnamed groups,
    /// one item per participating group; otherwise the whole match. Stops
    /// after the first match unless `all` is set.
    fn run(&self, _rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let names: Vec<&str> = self.regex.capture_names().flatten().collect();
        let mut out = Vec::new();

        for captures in self.regex.captures_iter(item.value()) {
            let whole = captures
                .get(0)
                .map(|m| m.as_bytes().to_vec())
                .unwrap_or_default();

            if !names.is_empty() {
                let overlay: Vec<(String, Vec<u8>)> = names
                    .iter()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), m.as_bytes().to_vec()))
                    })
                    .collect();
                out.push(item.clone_with(Some(whole), overlay));
            } else if captures.len() > 1 {
                for group in 1..captures.len() {
                    if let Some(m) = captures.get(group) {
                        out.push(item.with_value(m.as_bytes().to_vec()));
                    }
                }
            } else {
                out.push(item.with_value(whole));
            }

            if !self.all {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::execute;
    use super::super::test_support::*;

    fn values(items: &[crate::item::Item]) -> Vec<Vec<u8>> {
        items.iter().map(|i| i.value().to_vec()).collect()
    }

    #[test]
    fn test_whole_match() {
        with_runtime(|rt| {
            let s = load("regex: 'v[0-9]+'\n");
            let out = execute(s.as_ref(), rt, items(&[b"release v42 and v43"])).unwrap();
            assert_eq!(values(&out), [b"v42".to_vec()]);
        });
    }

    #[test]
    fn test_all_matches() {
        with_runtime(|rt| {
            let s = load("regex: 'v[0-9]+'\nall: true\n");
            let out = execute(s.as_ref(), rt, items(&[b"release v42 and v43"])).unwrap();
            assert_eq!(values(&out), [b"v42".to_vec(), b"v43".to_vec()]);
        });
    }

    #[test]
    fn test_unnamed_groups_emit_per_group() {
        with_runtime(|rt| {
            let s = load("regex: '(\\w+)=(\\w+)'\n");
            let out = execute(s.as_ref(), rt, items(&[b"key=value rest"])).unwrap();
            assert_eq!(values(&out), [b"key".to_vec(), b"value".to_vec()]);
        });
    }

    #[test]
    fn test_named_groups_become_vars() {
        with_runtime(|rt| {
            let s = load("regex: '(?P<name>\\w+)=(?P<val>\\w+)'\n");
            let out = execute(s.as_ref(), rt, items(&[b"key=value rest"])).unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].value(), b"key=value");
            assert_eq!(out[0].var("name"), Some(&b"key"[..]));
            assert_eq!(out[0].var("val"), Some(&b"value"[..]));
        });
    }

    #[test]
    fn test_no_match_is_empty() {
        with_runtime(|rt| {
            let s = load("regex: 'zzz'\n");
            let out = execute(s.as_ref(), rt, items(&[b"abc"])).unwrap();
            assert!(out.is_empty());
        });
    }
}
