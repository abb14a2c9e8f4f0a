//! Route table spec parsing and matching, plus the handler seam.
//!
//! The batch core never consults ambient routing state: it receives a [`RouteResolver`] at
//! construction and resolves every sub-request path through it. [`RouteTable`] is the concrete
//! resolver, a compiled `matchit` matcher built either from a small YAML document mapping path
//! templates to handler specs, or programmatically via [`RouteTable::route`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde::Deserialize;

#[derive(Debug, Clone)]
/// One synthetic request handed to a [`SubHandler`].
pub struct SubRequest {
    /// The resolved sub-request path (query string stripped).
    pub path: String,
    /// Parameters captured by the matched path template.
    pub path_params: HashMap<String, String>,
    /// Query pairs carried by the sub-request path itself (e.g. `/foo?x=1`).
    pub query: HashMap<String, String>,
    /// Headers copied from the batch caller, already filtered by the forwarding policy.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
/// Response produced by one handler invocation.
pub struct SubResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl SubResponse {
    /// Convenience constructor for a plain text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            body: Bytes::from(body.into()),
        }
    }

    /// Convenience constructor for a JSON response.
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: body.into(),
        }
    }
}

#[async_trait]
/// An in-process request handler, the unit a sub-request path resolves to.
///
/// Handlers are invoked both for direct calls and for sub-requests of a batch; they cannot tell
/// the difference.
pub trait SubHandler: Send + Sync {
    async fn handle(&self, req: SubRequest) -> anyhow::Result<SubResponse>;
}

/// Outcome of resolving a path against a [`RouteResolver`].
pub enum Resolution {
    /// A template matched; the handler and any captured parameters.
    Matched {
        handler: Arc<dyn SubHandler>,
        path_params: HashMap<String, String>,
    },
    /// No configured template matched the path.
    NotFound,
}

/// The routing capability the batch dispatcher depends on.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Resolution;
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// One handler entry in the route table YAML.
enum HandlerSpec {
    /// Fixed response, regardless of input.
    Static {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        content_type: Option<String>,
        #[serde(default)]
        body: String,
    },
    /// Reflects the sub-request back as JSON. Useful for smoke tests.
    Echo,
}

#[derive(Debug, Clone, Deserialize)]
/// Route table document: `routes: { template: handler-spec }`.
struct RouteTableSpec {
    routes: BTreeMap<String, HandlerSpec>,
}

/// A compiled path matcher mapping templates to handlers.
pub struct RouteTable {
    router: matchit::Router<Arc<dyn SubHandler>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            router: matchit::Router::new(),
        }
    }

    /// Register a handler under a path template (e.g. `/v1/items/{id}`).
    pub fn route(&mut self, template: &str, handler: Arc<dyn SubHandler>) -> anyhow::Result<()> {
        if !template.starts_with('/') {
            anyhow::bail!("path templates must start with '/': {template}");
        }
        self.router.insert(template, handler)?;
        Ok(())
    }

    /// Parse and compile a YAML route table.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let spec: RouteTableSpec = serde_yaml::from_slice(bytes)?;
        let mut table = Self::new();
        for (template, handler) in spec.routes {
            let handler: Arc<dyn SubHandler> = match handler {
                HandlerSpec::Static {
                    status,
                    content_type,
                    body,
                } => Arc::new(StaticHandler::new(status, content_type, body)?),
                HandlerSpec::Echo => Arc::new(EchoHandler),
            };
            table.route(&template, handler)?;
        }
        Ok(table)
    }
}

impl RouteResolver for RouteTable {
    fn resolve(&self, path: &str) -> Resolution {
        let Ok(matched) = self.router.at(path) else {
            return Resolution::NotFound;
        };
        Resolution::Matched {
            handler: Arc::clone(matched.value),
            path_params: matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Serves a fixed response.
pub struct StaticHandler {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

impl StaticHandler {
    pub fn new(status: u16, content_type: Option<String>, body: String) -> anyhow::Result<Self> {
        Ok(Self {
            status: StatusCode::from_u16(status)?,
            content_type,
            body: Bytes::from(body),
        })
    }
}

#[async_trait]
impl SubHandler for StaticHandler {
    async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
        Ok(SubResponse {
            status: self.status,
            content_type: self.content_type.clone(),
            body: self.body.clone(),
        })
    }
}

/// Reflects the sub-request back as a deterministic JSON object (sorted keys).
pub struct EchoHandler;

#[async_trait]
impl SubHandler for EchoHandler {
    async fn handle(&self, req: SubRequest) -> anyhow::Result<SubResponse> {
        let params: BTreeMap<_, _> = req.path_params.into_iter().collect();
        let query: BTreeMap<_, _> = req.query.into_iter().collect();
        let headers: BTreeMap<_, _> = req.headers.into_iter().collect();
        let body = serde_json::to_vec(&serde_json::json!({
            "path": req.path,
            "params": params,
            "query": query,
            "headers": headers,
        }))?;
        Ok(SubResponse::json(StatusCode::OK, body))
    }
}
