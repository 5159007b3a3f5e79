//! Webhook delivery with a literal `MESSAGE` substitution slot.

use super::{Action, ActionResult, ErrorPayload, ReportPayload};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::Value;

pub struct SlackAction {
    url: String,
    payload: Value,
}

pub fn build_slack(mut node: Node) -> LoadResult<Box<dyn Action>> {
    Ok(Box::new(SlackAction {
        url: node.take_req_str("url")?,
        payload: Value::Map(node.take_map("payload")),
    }))
}

impl SlackAction {
    /// Serialize the payload template and substitute the JSON-escaped
    /// message for every literal `MESSAGE` before posting.
    fn post(&self, rt: &mut Runtime, message: &str) -> ActionResult<()> {
        let template = serde_json::to_string(&self.payload.to_json())?;
        let escaped = serde_json::to_string(message)?;
        let escaped = escaped.trim_matches('"');
        let body = template.replace("MESSAGE", escaped);

        let client = rt.http(true)?;
        let response = client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()?;
        if !response.status().is_success() {
            tracing::warn!(
                status = response.status().as_u16(),
                url = %self.url,
                "webhook delivery rejected"
            );
        }
        Ok(())
    }
}

impl Action for SlackAction {
    fn report(&self, rt: &mut Runtime, payload: &ReportPayload) -> ActionResult<()> {
        self.post(rt, &payload.comment)
    }

    fn error(&self, rt: &mut Runtime, payload: &ErrorPayload) -> ActionResult<()> {
        self.post(rt, &payload.error)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ACTIONS;
    use super::*;
    use crate::cache::Cache;
    use crate::config::EngineConfig;

    #[test]
    fn test_message_substitution_is_json_escaped() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(r#"{"text":"line one\nline \"two\""}"#)
            .with_status(200)
            .create();

        let config = EngineConfig::default();
        let mut cache = Cache::ephemeral().unwrap();
        let mut rt = Runtime::new(&mut cache, &config);

        let yaml = format!("slack: {}/hook\n", server.url());
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let action = ACTIONS.load(&Value::from_yaml(&parsed)).unwrap();

        action
            .report(
                &mut rt,
                &ReportPayload {
                    comment: "line one\nline \"two\"".to_string(),
                    data: Vec::new(),
                },
            )
            .unwrap();
        mock.assert();
    }
}
