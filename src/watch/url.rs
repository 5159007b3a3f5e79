//! HTTP data fetching.

use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;

use super::data::{run_data_watch, DataCore};
use super::{Outcome, Watch, WatchCore, WatchError};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::{render_plain, Value};

pub struct UrlWatch {
    core: WatchCore,
    data: DataCore,
    url: String,
    method: String,
    headers: IndexMap<String, Value>,
    cookies: IndexMap<String, Value>,
    body: Option<String>,
    code: Option<i64>,
    download: Option<String>,
    verify: bool,
}

pub fn build_url(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(UrlWatch {
        url: node.take_req_str("url")?,
        method: node.take_str("method"),
        headers: node.take_map("headers"),
        cookies: node.take_map("cookies"),
        body: node.take_opt_str("body"),
        code: node.take_opt_int("code"),
        download: node.take_opt_str("download"),
        verify: node.take_bool("verify"),
        data: DataCore::from_node(&mut node),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for UrlWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let ex_url = rt.ctx.expand_str(&self.url)?;
        let ex_headers = match rt.ctx.expand(&Value::Map(self.headers.clone()))? {
            Value::Map(map) => map,
            _ => IndexMap::new(),
        };
        let ex_cookies = match rt.ctx.expand(&Value::Map(self.cookies.clone()))? {
            Value::Map(map) => map,
            _ => IndexMap::new(),
        };
        let ex_body = match &self.body {
            Some(body) => Some(rt.ctx.expand_str(body)?),
            None => None,
        };

        let parsed = url::Url::parse(&ex_url)
            .map_err(|e| WatchError::Fetch(format!("invalid url '{}': {}", ex_url, e)))?;

        // Configured cookies land in the shared jar for the request host, so
        // they persist for sibling watches in this runtime.
        if !ex_cookies.is_empty() {
            let jar = rt.cookie_jar();
            for (name, value) in &ex_cookies {
                jar.add_cookie_str(&format!("{}={}", name, render_plain(value)), &parsed);
            }
        }

        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| WatchError::Fetch(format!("invalid method '{}'", self.method)))?;
        let client = rt
            .http(self.verify)
            .map_err(|e| WatchError::Fetch(e.to_string()))?;

        let mut request = client.request(method, parsed);
        for (name, value) in &ex_headers {
            request = request.header(name.as_str(), render_plain(value));
        }
        if let Some(body) = ex_body {
            request = request.body(body);
        }

        let response = request
            .send()
            .map_err(|e| WatchError::Fetch(e.to_string()))?;
        let status = response.status();
        tracing::debug!("url watch: [{}] {}", status, ex_url);

        if let Some(expected) = self.code {
            if i64::from(status.as_u16()) != expected {
                return Err(WatchError::Fetch(format!(
                    "status code {} != {}",
                    status.as_u16(),
                    expected
                )));
            }
        }

        let fetched = match &self.download {
            Some(download) => {
                let ex_download = rt.ctx.expand_str(download)?;
                let location = resolve_download_path(&ex_download)?;
                let mut file = std::fs::File::create(&location)
                    .map_err(|e| WatchError::Fetch(e.to_string()))?;
                let mut response = response;
                response
                    .copy_to(&mut file)
                    .map_err(|e| WatchError::Fetch(e.to_string()))?;
                vec![location.to_string_lossy().into_owned().into_bytes()]
            }
            None => vec![response
                .bytes()
                .map_err(|e| WatchError::Fetch(e.to_string()))?
                .to_vec()],
        };

        run_data_watch(
            &self.core,
            &self.data,
            rt,
            fetched,
            &[("URL", Value::Str(ex_url))],
        )
    }
}

/// Resolve a download target relative to the working directory, rejecting
/// anything that escapes it before the file is opened.
fn resolve_download_path(download: &str) -> Result<PathBuf, WatchError> {
    let cwd = std::env::current_dir().map_err(|e| WatchError::Fetch(e.to_string()))?;
    let location = normalize(&cwd.join(download));
    if !location.starts_with(&cwd) || location == cwd {
        return Err(WatchError::Fetch(format!(
            "invalid download path '{}'",
            download
        )));
    }
    Ok(location)
}

/// Lexically resolve `.` and `..` components without touching the
/// filesystem (the target may not exist yet).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_fetch_body() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/status")
            .with_status(200)
            .with_body("all good")
            .create();

        with_runtime(|rt| {
            let mut w = load(&format!(
                "url: {}/status\nmatch: none\ncomment: '{{{{ data }}}}'\n",
                server.url()
            ));
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "all good");
        });
    }

    #[test]
    fn test_status_mismatch_is_fetch_error() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/gone").with_status(404).create();

        with_runtime(|rt| {
            let mut w = load(&format!("url: {}/gone\n", server.url()));
            assert!(matches!(w.process(rt), Err(WatchError::Fetch(_))));

            // An explicitly null code disables the check.
            let mut w = load(&format!("url: {}/gone\ncode: ~\nmatch: none\n", server.url()));
            assert!(w.process(rt).is_ok());
        });
    }

    #[test]
    fn test_headers_and_method() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/submit")
            .match_header("x-token", "abc")
            .match_body("payload")
            .with_status(200)
            .create();

        with_runtime(|rt| {
            let mut w = load(&format!(
                "url: {}/submit\nmethod: POST\nheaders:\n  x-token: abc\nbody: payload\nmatch: none\n",
                server.url()
            ));
            w.process(rt).unwrap();
        });
        mock.assert();
    }

    #[test]
    fn test_cookies_persist_across_watches() {
        let mut server = mockito::Server::new();
        let first = server
            .mock("GET", "/a")
            .match_header("cookie", "session=s1")
            .with_status(200)
            .create();
        let second = server
            .mock("GET", "/b")
            .match_header("cookie", "session=s1")
            .with_status(200)
            .create();

        with_runtime(|rt| {
            let mut w = load(&format!(
                "url: {}/a\ncookies:\n  session: s1\nmatch: none\n",
                server.url()
            ));
            w.process(rt).unwrap();
            // The sibling watch sets no cookies; the jar still carries them.
            let mut w = load(&format!("url: {}/b\nmatch: none\n", server.url()));
            w.process(rt).unwrap();
        });
        first.assert();
        second.assert();
    }

    #[test]
    fn test_download_path_escape_rejected() {
        assert!(resolve_download_path("../outside.bin").is_err());
        assert!(resolve_download_path("/etc/passwd").is_err());
        assert!(resolve_download_path(".").is_err());
        assert!(resolve_download_path("inside.bin").is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_download_writes_file_and_emits_path() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/artifact")
            .with_body("binary-ish")
            .create();

        let dir = tempfile::TempDir::new().unwrap();
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        with_runtime(|rt| {
            let mut w = load(&format!(
                "url: {}/artifact\ndownload: artifact.bin\nmatch: none\ncomment: '{{{{ data }}}}'\n",
                server.url()
            ));
            let outcome = w.process(rt).unwrap();
            let path = comment_lines(&outcome);
            assert!(path.ends_with("artifact.bin"));
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "binary-ish");
        });

        std::env::set_current_dir(previous).unwrap();
    }
}
