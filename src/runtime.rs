//! Per-run execution state shared by watches, selectors, matches, and
//! actions.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use reqwest::blocking::Client;
use reqwest::cookie::Jar;

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::value::Value;

/// Everything a watch tree needs while executing: the variable context, the
/// shared cache, engine configuration, the template map from the watch file,
/// and a lazily built HTTP session.
///
/// One runtime exists per watch file; the cookie jar is shared across every
/// URL watch in it so cookies persist between sibling requests.
pub struct Runtime<'a> {
    pub ctx: Context,
    pub cache: &'a mut Cache,
    pub config: &'a EngineConfig,
    pub templates: IndexMap<String, Value>,
    jar: Arc<Jar>,
    clients: HashMap<bool, Client>,
}

impl<'a> Runtime<'a> {
    pub fn new(cache: &'a mut Cache, config: &'a EngineConfig) -> Self {
        Self {
            ctx: Context::new(),
            cache,
            config,
            templates: IndexMap::new(),
            jar: Arc::new(Jar::default()),
            clients: HashMap::new(),
        }
    }

    /// The shared cookie jar for this runtime's HTTP session.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// HTTP client for this runtime, built on first use. Clients are cheap
    /// to clone (shared connection pool); both TLS modes share the jar.
    pub fn http(&mut self, verify: bool) -> Result<Client, reqwest::Error> {
        if let Some(client) = self.clients.get(&verify) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .cookie_provider(self.jar.clone())
            .danger_accept_invalid_certs(!verify)
            .build()?;
        self.clients.insert(verify, client.clone());
        Ok(client)
    }

    /// Look up a named configuration template from the current watch file.
    pub fn template(&self, name: &str) -> Option<&Value> {
        self.templates.get(name)
    }
}
