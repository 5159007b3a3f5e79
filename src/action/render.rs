//! Accumulating JSON document rendering.
//!
//! Each report's structured records merge into `<data_path>/<name>.json`:
//! entries are keyed by their `id` field (replace on collision, append
//! otherwise) and the array is kept sorted on every write.

use std::fs;

use super::{Action, ActionResult, ReportPayload};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;

pub struct RenderAction {
    name: String,
    sort: Vec<String>,
}

pub fn build_render(mut node: Node) -> LoadResult<Box<dyn Action>> {
    Ok(Box::new(RenderAction {
        name: node.take_req_str("name")?,
        sort: node.take_str_list("sort"),
    }))
}

fn field_text(entry: &serde_json::Value, field: &str) -> String {
    match entry.get(field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl RenderAction {
    fn sort_key(&self, entry: &serde_json::Value) -> Vec<String> {
        if self.sort.is_empty() {
            vec![field_text(entry, "id")]
        } else {
            self.sort.iter().map(|f| field_text(entry, f)).collect()
        }
    }
}

impl Action for RenderAction {
    fn report(&self, rt: &mut Runtime, payload: &ReportPayload) -> ActionResult<()> {
        let path = rt.config.data_path.join(format!("{}.json", self.name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entries: Vec<serde_json::Value> = if path.is_file() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Vec::new()
        };

        for datum in &payload.data {
            let entry = datum.to_json();
            let id = field_text(&entry, "id");
            match entries.iter_mut().find(|e| field_text(e, "id") == id) {
                Some(slot) => *slot = entry,
                None => entries.push(entry),
            }
        }

        entries.sort_by_key(|e| self.sort_key(e));
        fs::write(&path, serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ReportPayload, ACTIONS};
    use crate::cache::Cache;
    use crate::config::EngineConfig;
    use crate::runtime::Runtime;
    use crate::value::Value;

    fn datum(pairs: &[(&str, &str)]) -> Value {
        let mut map = Value::map();
        for (k, v) in pairs {
            map.insert(k.to_string(), Value::from(*v));
        }
        Value::Map(map)
    }

    #[test]
    fn test_append_replace_and_sort() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.data_path = dir.path().to_path_buf();
        let mut cache = Cache::ephemeral().unwrap();
        let mut rt = Runtime::new(&mut cache, &config);

        let parsed: serde_yaml::Value =
            serde_yaml::from_str("render: releases\nsort: [id]\n").unwrap();
        let action = ACTIONS.load(&Value::from_yaml(&parsed)).unwrap();

        action
            .report(
                &mut rt,
                &ReportPayload {
                    comment: String::new(),
                    data: vec![
                        datum(&[("id", "b"), ("state", "old")]),
                        datum(&[("id", "a"), ("state", "ok")]),
                    ],
                },
            )
            .unwrap();
        action
            .report(
                &mut rt,
                &ReportPayload {
                    comment: String::new(),
                    data: vec![datum(&[("id", "b"), ("state", "new")])],
                },
            )
            .unwrap();

        let written: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(dir.path().join("releases.json")).unwrap())
                .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["id"], "a");
        assert_eq!(written[1]["id"], "b");
        assert_eq!(written[1]["state"], "new");
    }
}
