//! axum server wiring.
//!
//! The gateway exposes:
//! - `/healthz` and `/readyz`
//! - `GET /batch`, which fans the `label=path` query pairs out over the route table
//! - a catch-all handler that serves every route-table path directly
//!
//! `/batch` itself is not part of the route table, so a sub-request targeting `/batch` resolves
//! to `UnresolvedRoute` rather than recursing.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use opentelemetry::trace::TraceContextExt as _;
use tokio::sync::Semaphore;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;
use uuid::Uuid;

use crate::{
    batch::{BatchDispatcher, BatchParseError, BatchRequest, CallerContext},
    config::{ForwardHeadersConfig, GatewayConfig},
    routes::{Resolution, RouteResolver, RouteTable, SubRequest},
};

#[derive(Clone)]
struct AppState {
    routes: Arc<RouteTable>,
    dispatcher: Arc<BatchDispatcher>,
    inflight_batches: Arc<Semaphore>,
    max_subrequests: usize,
    batch_timeout: Duration,
    forward_headers: HeaderForwardPolicy,
}

#[derive(Debug, Clone)]
/// HTTP response returned to the client.
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Convenience constructor for a plain text response (no default content-type is set).
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: http::HeaderMap::new(),
            body: Bytes::from(body.into()),
        }
    }

    /// Convenience constructor for a JSON response.
    pub fn json(status: StatusCode, body: Bytes) -> Self {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body,
        }
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> axum::response::Response {
        let mut res = axum::response::Response::new(Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

#[derive(Clone)]
struct HeaderForwardPolicy {
    allow: Option<std::collections::HashSet<http::HeaderName>>,
    deny: std::collections::HashSet<http::HeaderName>,
}

impl HeaderForwardPolicy {
    fn try_from_cfg(cfg: &ForwardHeadersConfig) -> anyhow::Result<Self> {
        let allow = if cfg.allow.is_empty() {
            None
        } else {
            let mut set = std::collections::HashSet::with_capacity(cfg.allow.len());
            for name in &cfg.allow {
                set.insert(http::HeaderName::from_bytes(name.as_bytes())?);
            }
            Some(set)
        };

        let mut deny = std::collections::HashSet::with_capacity(cfg.deny.len());
        for name in &cfg.deny {
            deny.insert(http::HeaderName::from_bytes(name.as_bytes())?);
        }

        Ok(Self { allow, deny })
    }

    fn should_forward(&self, name: &http::HeaderName) -> bool {
        if is_hop_by_hop_header(name) {
            return false;
        }
        if self.deny.contains(name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }
}

fn is_hop_by_hop_header(name: &http::HeaderName) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc2616#section-13.5.1
    // (plus `TE` per common implementations)
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

struct HeaderMapInjector<'a>(&'a mut HashMap<String, String>);

impl opentelemetry::propagation::Injector for HeaderMapInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

/// Inject the current trace context into the forwarded sub-request headers, so in-process
/// handlers see a `traceparent` even when the batch caller isn't traced.
fn inject_trace_context(headers: &mut HashMap<String, String>) {
    let cx = tracing::Span::current().context();
    if !cx.span().span_context().is_valid() {
        return;
    }

    let mut injector = HeaderMapInjector(headers);
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut injector);
    });
}

fn forwarded_headers(
    policy: &HeaderForwardPolicy,
    headers: &http::HeaderMap,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        if !policy.should_forward(name) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.insert(name.as_str().to_string(), v.to_string());
        }
    }
    out
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/batch", get(handle_batch))
        .fallback(handle_direct)
        .with_state(state)
}

pub async fn run(cfg: GatewayConfig, routes: RouteTable) -> anyhow::Result<()> {
    let routes = Arc::new(routes);
    let dispatcher = Arc::new(BatchDispatcher::new(
        Arc::clone(&routes) as Arc<dyn RouteResolver>
    ));
    let forward_headers = HeaderForwardPolicy::try_from_cfg(&cfg.forward_headers)?;

    let state = AppState {
        routes,
        dispatcher,
        inflight_batches: Arc::new(Semaphore::new(cfg.max_inflight_batches)),
        max_subrequests: cfg.max_subrequests,
        batch_timeout: Duration::from_millis(cfg.batch_timeout_ms),
        forward_headers,
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(listen_addr = %cfg.listen_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The batch endpoint: fan the query pairs out, join on all results, reply with one JSON object.
async fn handle_batch(State(state): State<AppState>, req: Request<Body>) -> axum::response::Response {
    let _permit = match state.inflight_batches.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(
                event = "admission_rejected",
                reason = "too_many_inflight_batches",
                "batch rejected"
            );
            return GatewayResponse::text(StatusCode::TOO_MANY_REQUESTS, "too many requests")
                .into_response();
        }
    };

    let raw_query = req.uri().query().unwrap_or("");
    let batch = match BatchRequest::from_query(raw_query) {
        Ok(b) => b,
        Err(BatchParseError::DuplicateLabel(label)) => {
            tracing::debug!(
                event = "batch_rejected",
                reason = "duplicate_label",
                label = %label,
                "batch rejected"
            );
            return GatewayResponse::text(
                StatusCode::BAD_REQUEST,
                format!("duplicate label: {label}"),
            )
            .into_response();
        }
    };

    if batch.len() > state.max_subrequests {
        tracing::debug!(
            event = "batch_rejected",
            reason = "too_many_subrequests",
            subrequests = batch.len(),
            limit = state.max_subrequests,
            "batch rejected"
        );
        return GatewayResponse::text(StatusCode::BAD_REQUEST, "too many sub-requests")
            .into_response();
    }

    let mut headers = forwarded_headers(&state.forward_headers, req.headers());
    inject_trace_context(&mut headers);
    let ctx = CallerContext { headers };

    let batch_id = format!("b-{}", Uuid::new_v4());
    tracing::debug!(
        event = "batch_accepted",
        batch_id = %batch_id,
        subrequests = batch.len(),
        "dispatching"
    );

    match tokio::time::timeout(state.batch_timeout, state.dispatcher.dispatch(batch, &ctx)).await {
        Ok(response) => {
            GatewayResponse::json(StatusCode::OK, response.to_json_body()).into_response()
        }
        Err(_) => {
            tracing::warn!(
                event = "batch_timeout",
                batch_id = %batch_id,
                timeout_ms = state.batch_timeout.as_millis() as u64,
                "batch timed out; outstanding sub-requests aborted"
            );
            GatewayResponse::text(StatusCode::GATEWAY_TIMEOUT, "timeout").into_response()
        }
    }
}

/// Catch-all for direct (non-batch) requests. Resolves against the same route table the batch
/// endpoint uses.
async fn handle_direct(
    State(state): State<AppState>,
    req: Request<Body>,
) -> axum::response::Response {
    let path = req.uri().path().to_string();

    let Resolution::Matched {
        handler,
        path_params,
    } = state.routes.resolve(&path)
    else {
        return GatewayResponse::text(StatusCode::NOT_FOUND, "not found").into_response();
    };

    let headers = forwarded_headers(&state.forward_headers, req.headers());

    let mut query = HashMap::new();
    if let Some(raw) = req.uri().query() {
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            query.insert(k.into_owned(), v.into_owned());
        }
    }

    let sub = SubRequest {
        path: path.clone(),
        path_params,
        query,
        headers,
    };

    match handler.handle(sub).await {
        Ok(resp) => {
            let mut out = GatewayResponse {
                status: resp.status,
                headers: http::HeaderMap::new(),
                body: resp.body,
            };
            if let Some(ct) = resp.content_type {
                if let Ok(value) = ct.parse() {
                    out.headers.insert(http::header::CONTENT_TYPE, value);
                }
            }
            out.into_response()
        }
        Err(err) => {
            tracing::warn!(
                event = "handler_error",
                path = %path,
                cause = %err,
                "direct handler failed"
            );
            GatewayResponse::text(StatusCode::INTERNAL_SERVER_ERROR, "handler error")
                .into_response()
        }
    }
}
