//! Tools the language model may call.
//!
//! A tool is a name, a JSON Schema for its argument object, an optional
//! result schema, and an optional phrase spoken while it runs. Invocation is
//! `(arguments object) -> JSON result`.

use super::manifest;
use crate::config::HttpToolConfig;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: Value,
    /// JSON Schema of the result, when known.
    pub returns: Option<Value>,
    /// Acknowledgement spoken while the tool runs.
    pub say: Option<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn call(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Tools available to one dialogue engine, looked up by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of HTTP tools from config.
    pub fn from_config(tools: &[HttpToolConfig]) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let mut registry = Self::new();
        for tool in tools {
            registry.register(Arc::new(HttpTool::new(tool.clone(), client.clone())))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.spec().name.clone();
        if self.tools.contains_key(&name) {
            anyhow::bail!("tool already registered: {name}");
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Specs in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.spec().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── HTTP tool ──────────────────────────────────────────────────────

/// Tool backed by an HTTP endpoint: POSTs the argument object, returns the
/// JSON response body.
pub struct HttpTool {
    spec: ToolSpec,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTool {
    /// Fields the config leaves out fall back to the built-in manifest entry
    /// of the same name.
    pub fn new(config: HttpToolConfig, client: reqwest::Client) -> Self {
        let builtin = manifest::find(&config.name);
        let description = if config.description.trim().is_empty() {
            builtin.as_ref().map(|b| b.description.clone()).unwrap_or_default()
        } else {
            config.description
        };
        let parameters = config
            .parameters
            .or_else(|| builtin.as_ref().map(|b| b.parameters.clone()))
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

        Self {
            spec: ToolSpec {
                description,
                parameters,
                returns: builtin.as_ref().and_then(|b| b.returns.clone()),
                say: config.say.or_else(|| builtin.and_then(|b| b.say)),
                name: config.name,
            },
            endpoint: config.endpoint,
            client,
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(arguments)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{} request failed: {e}", self.spec.name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {status}: {body}", self.spec.name);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| anyhow::anyhow!("{} returned invalid JSON: {e}", self.spec.name))
    }
}
