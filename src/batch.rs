//! Batch request parsing, fan-out/fan-in, and response assembly.
//!
//! One batch request carries an ordered mapping of labels to sub-request paths. The dispatcher
//! spawns one task per distinct target, each task resolves its path through the shared
//! [`RouteResolver`] and runs the handler, and the aggregator joins on all outcomes before
//! serializing them into a single JSON object in the original label order.
//!
//! Failure policy: a failed sub-request degrades to an error object under its label. It never
//! fails the batch (see DESIGN.md).

use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::de::IgnoredAny;
use tokio::task::JoinSet;

use crate::routes::{Resolution, RouteResolver, SubRequest, SubResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Ordered `label -> target path` pairs parsed from the incoming query string.
pub struct BatchRequest {
    pairs: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
/// Errors that can occur while parsing a batch request.
pub enum BatchParseError {
    /// The same label appeared more than once.
    DuplicateLabel(String),
}

impl BatchRequest {
    /// Parse the raw query string of a batch call, preserving pair order.
    ///
    /// Zero pairs is valid and yields an empty batch.
    pub fn from_query(raw: &str) -> Result<Self, BatchParseError> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (label, target) in url::form_urlencoded::parse(raw.as_bytes()) {
            if pairs.iter().any(|(existing, _)| *existing == label) {
                return Err(BatchParseError::DuplicateLabel(label.into_owned()));
            }
            pairs.push((label.into_owned(), target.into_owned()));
        }
        Ok(Self { pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Labels in request order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(label, _)| label.as_str())
    }
}

#[derive(Debug, Clone, Default)]
/// The caller context reused by every synthetic sub-request of one batch.
pub struct CallerContext {
    /// Caller headers that passed the forwarding policy.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
/// The outcome of invoking one sub-request path.
pub enum SubOutcome {
    /// The handler produced a response (any status).
    Success(SubResponse),
    /// No route matched the sub-request path.
    UnresolvedRoute,
    /// The handler returned an error or panicked.
    HandlerError { cause: String },
}

/// Fans one [`BatchRequest`] out to concurrent sub-invocations and joins on all of them.
pub struct BatchDispatcher {
    routes: Arc<dyn RouteResolver>,
}

impl BatchDispatcher {
    /// Create a dispatcher over an explicit routing capability.
    pub fn new(routes: Arc<dyn RouteResolver>) -> Self {
        Self { routes }
    }

    /// Execute every sub-request and assemble the combined response.
    ///
    /// Labels sharing an identical target string share one invocation and one outcome. Dropping
    /// the returned future (caller disconnect, batch deadline) aborts all outstanding
    /// sub-invocations.
    pub async fn dispatch(&self, batch: BatchRequest, ctx: &CallerContext) -> BatchResponse {
        let mut slot_by_target: HashMap<String, usize> = HashMap::new();
        let mut targets: Vec<String> = Vec::new();
        for (_, target) in &batch.pairs {
            if !slot_by_target.contains_key(target) {
                slot_by_target.insert(target.clone(), targets.len());
                targets.push(target.clone());
            }
        }

        tracing::debug!(
            event = "batch_collecting",
            labels = batch.pairs.len(),
            targets = targets.len(),
            "dispatching sub-requests"
        );

        let mut tasks = JoinSet::new();
        let mut slot_by_task: HashMap<tokio::task::Id, usize> = HashMap::new();
        for (slot, target) in targets.iter().enumerate() {
            let routes = Arc::clone(&self.routes);
            let target = target.clone();
            let headers = ctx.headers.clone();
            let handle = tasks.spawn(async move { invoke_target(routes, &target, headers).await });
            slot_by_task.insert(handle.id(), slot);
        }

        let mut outcomes: Vec<Option<SubOutcome>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(&slot) = slot_by_task.get(&id) {
                        outcomes[slot] = Some(outcome);
                    }
                }
                Err(err) => {
                    let Some(&slot) = slot_by_task.get(&err.id()) else {
                        continue;
                    };
                    let cause = if err.is_panic() {
                        tracing::warn!(
                            event = "subrequest_panicked",
                            target = %targets[slot],
                            "sub-request handler panicked"
                        );
                        "handler panicked".to_string()
                    } else {
                        format!("sub-task failed: {err}")
                    };
                    outcomes[slot] = Some(SubOutcome::HandlerError { cause });
                }
            }
        }

        tracing::debug!(event = "batch_aggregating", "all sub-results in");

        let entries = batch
            .pairs
            .into_iter()
            .map(|(label, target)| {
                let slot = slot_by_target[&target];
                let outcome = outcomes[slot]
                    .clone()
                    .unwrap_or(SubOutcome::HandlerError {
                        cause: "missing sub-result".to_string(),
                    });
                (label, outcome)
            })
            .collect();

        BatchResponse { entries }
    }
}

/// Resolve one target against the routing capability and run its handler.
async fn invoke_target(
    routes: Arc<dyn RouteResolver>,
    target: &str,
    headers: HashMap<String, String>,
) -> SubOutcome {
    let (path, raw_query) = match target.split_once('?') {
        Some((path, raw_query)) => (path, raw_query),
        None => (target, ""),
    };

    let Resolution::Matched {
        handler,
        path_params,
    } = routes.resolve(path)
    else {
        tracing::debug!(event = "subrequest_unresolved", path = %path, "no route for sub-request");
        return SubOutcome::UnresolvedRoute;
    };

    let mut query = HashMap::new();
    if !raw_query.is_empty() {
        for (k, v) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            query.insert(k.into_owned(), v.into_owned());
        }
    }

    let req = SubRequest {
        path: path.to_string(),
        path_params,
        query,
        headers,
    };

    match handler.handle(req).await {
        Ok(resp) => SubOutcome::Success(resp),
        Err(err) => {
            tracing::debug!(
                event = "subrequest_failed",
                path = %path,
                cause = %err,
                "handler returned an error"
            );
            SubOutcome::HandlerError {
                cause: format!("{err:#}"),
            }
        }
    }
}

/// The joined results of one batch, in original label order.
pub struct BatchResponse {
    entries: Vec<(String, SubOutcome)>,
}

impl BatchResponse {
    pub fn entries(&self) -> &[(String, SubOutcome)] {
        &self.entries
    }

    /// Serialize into a single JSON object, one member per label, in request order.
    pub fn to_json_body(&self) -> Bytes {
        let mut out = String::with_capacity(2 + self.entries.len() * 32);
        out.push('{');
        for (i, (label, outcome)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&json_string(label));
            out.push(':');
            write_outcome(&mut out, outcome);
        }
        out.push('}');
        Bytes::from(out)
    }
}

// `Display` for `Value` is infallible, unlike `serde_json::to_string`.
fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn write_outcome(out: &mut String, outcome: &SubOutcome) {
    match outcome {
        SubOutcome::Success(resp) => write_payload(out, resp),
        SubOutcome::UnresolvedRoute => out.push_str(r#"{"error":"UnresolvedRoute"}"#),
        SubOutcome::HandlerError { cause } => {
            out.push_str(r#"{"error":"HandlerError","cause":"#);
            out.push_str(&json_string(cause));
            out.push('}');
        }
    }
}

/// Embed a successful sub-response body under its label.
///
/// A body that is one complete JSON value is embedded verbatim; other UTF-8 bodies become JSON
/// strings; anything else is base64-wrapped.
fn write_payload(out: &mut String, resp: &SubResponse) {
    if serde_json::from_slice::<IgnoredAny>(&resp.body).is_ok() {
        if let Ok(raw) = std::str::from_utf8(&resp.body) {
            out.push_str(raw);
            return;
        }
    }

    match std::str::from_utf8(&resp.body) {
        Ok(text) => out.push_str(&json_string(text)),
        Err(_) => {
            out.push_str(r#"{"encoding":"base64","body":"#);
            out.push_str(&json_string(&STANDARD.encode(&resp.body)));
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteTable, StaticHandler, SubHandler};
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    fn text_route(table: &mut RouteTable, template: &str, body: &str) {
        table
            .route(
                template,
                Arc::new(StaticHandler::new(200, Some("text/plain".to_string()), body.to_string()).unwrap()),
            )
            .unwrap();
    }

    fn dispatcher(table: RouteTable) -> BatchDispatcher {
        BatchDispatcher::new(Arc::new(table))
    }

    async fn dispatch_query(dispatcher: &BatchDispatcher, raw: &str) -> Bytes {
        let batch = BatchRequest::from_query(raw).unwrap();
        dispatcher
            .dispatch(batch, &CallerContext::default())
            .await
            .to_json_body()
    }

    #[test]
    fn from_query_preserves_order_and_rejects_duplicates() {
        let batch = BatchRequest::from_query("b=/bar&a=/foo").unwrap();
        assert_eq!(batch.labels().collect::<Vec<_>>(), vec!["b", "a"]);

        assert_eq!(
            BatchRequest::from_query("a=/foo&a=/bar"),
            Err(BatchParseError::DuplicateLabel("a".to_string()))
        );
    }

    #[test]
    fn empty_query_is_a_valid_empty_batch() {
        let batch = BatchRequest::from_query("").unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn two_labels_aggregate_in_request_order() {
        let mut table = RouteTable::new();
        text_route(&mut table, "/foo", "foo");
        text_route(&mut table, "/bar", "bar");
        let d = dispatcher(table);

        let body = dispatch_query(&d, "f=/foo&b=/bar").await;
        assert_eq!(&body[..], br#"{"f":"foo","b":"bar"}"#);

        // Order follows the request, not the route table.
        let body = dispatch_query(&d, "b=/bar&f=/foo").await;
        assert_eq!(&body[..], br#"{"b":"bar","f":"foo"}"#);
    }

    #[tokio::test]
    async fn unresolved_route_degrades_to_error_entry() {
        let mut table = RouteTable::new();
        text_route(&mut table, "/foo", "foo");
        let d = dispatcher(table);

        let body = dispatch_query(&d, "f=/foo&m=/missing").await;
        assert_eq!(&body[..], br#"{"f":"foo","m":{"error":"UnresolvedRoute"}}"#);
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_object() {
        let d = dispatcher(RouteTable::new());
        let body = dispatch_query(&d, "").await;
        assert_eq!(&body[..], b"{}");
    }

    struct FailingHandler;

    #[async_trait]
    impl SubHandler for FailingHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn handler_error_carries_cause_and_spares_other_labels() {
        let mut table = RouteTable::new();
        text_route(&mut table, "/foo", "foo");
        table.route("/fail", Arc::new(FailingHandler)).unwrap();
        let d = dispatcher(table);

        let body = dispatch_query(&d, "f=/foo&e=/fail").await;
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["f"], "foo");
        assert_eq!(v["e"]["error"], "HandlerError");
        assert_eq!(v["e"]["cause"], "boom");
    }

    struct PanickingHandler;

    #[async_trait]
    impl SubHandler for PanickingHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            panic!("kaboom")
        }
    }

    #[tokio::test]
    async fn handler_panic_is_recovered_as_handler_error() {
        let mut table = RouteTable::new();
        text_route(&mut table, "/foo", "foo");
        table.route("/panic", Arc::new(PanickingHandler)).unwrap();
        let d = dispatcher(table);

        let body = dispatch_query(&d, "p=/panic&f=/foo").await;
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["f"], "foo");
        assert_eq!(v["p"]["error"], "HandlerError");
        assert_eq!(v["p"]["cause"], "handler panicked");
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubHandler for CountingHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubResponse::text(StatusCode::OK, "counted"))
        }
    }

    #[tokio::test]
    async fn labels_sharing_a_target_invoke_once() {
        let counter = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let mut table = RouteTable::new();
        table.route("/ctr", counter.clone()).unwrap();
        let d = dispatcher(table);

        let body = dispatch_query(&d, "a=/ctr&b=/ctr").await;
        assert_eq!(&body[..], br#"{"a":"counted","b":"counted"}"#);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_path_with_different_queries_invokes_twice() {
        let counter = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let mut table = RouteTable::new();
        table.route("/ctr", counter.clone()).unwrap();
        let d = dispatcher(table);

        dispatch_query(&d, "a=/ctr?x=1&b=/ctr?x=2").await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    struct QueryEchoHandler;

    #[async_trait]
    impl SubHandler for QueryEchoHandler {
        async fn handle(&self, req: SubRequest) -> anyhow::Result<SubResponse> {
            let x = req.query.get("x").cloned().unwrap_or_default();
            Ok(SubResponse::text(StatusCode::OK, format!("x={x}")))
        }
    }

    #[tokio::test]
    async fn sub_target_query_string_reaches_the_handler() {
        let mut table = RouteTable::new();
        table.route("/q", Arc::new(QueryEchoHandler)).unwrap();
        let d = dispatcher(table);

        // `?` inside the target value must be percent-encoded by the caller.
        let body = dispatch_query(&d, "a=/q%3Fx%3D42").await;
        assert_eq!(&body[..], br#"{"a":"x=42"}"#);
    }

    struct Rendezvous {
        here: Notify,
        there: Notify,
    }

    struct LeftHandler(Arc<Rendezvous>);
    struct RightHandler(Arc<Rendezvous>);

    #[async_trait]
    impl SubHandler for LeftHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            self.0.here.notify_one();
            self.0.there.notified().await;
            Ok(SubResponse::text(StatusCode::OK, "left"))
        }
    }

    #[async_trait]
    impl SubHandler for RightHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            self.0.here.notified().await;
            self.0.there.notify_one();
            Ok(SubResponse::text(StatusCode::OK, "right"))
        }
    }

    #[tokio::test]
    async fn sub_requests_run_concurrently() {
        // Each handler blocks until the other has made progress; a sequential
        // dispatcher would deadlock here.
        let rendezvous = Arc::new(Rendezvous {
            here: Notify::new(),
            there: Notify::new(),
        });
        let mut table = RouteTable::new();
        table
            .route("/left", Arc::new(LeftHandler(rendezvous.clone())))
            .unwrap();
        table
            .route("/right", Arc::new(RightHandler(rendezvous.clone())))
            .unwrap();
        let d = dispatcher(table);

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            dispatch_query(&d, "l=/left&r=/right"),
        )
        .await
        .expect("fan-out must run sub-requests concurrently");
        assert_eq!(&body[..], br#"{"l":"left","r":"right"}"#);
    }

    struct SendOnDrop(Option<oneshot::Sender<()>>);

    impl Drop for SendOnDrop {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    struct HangingHandler {
        dropped: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl SubHandler for HangingHandler {
        async fn handle(&self, _req: SubRequest) -> anyhow::Result<SubResponse> {
            let _guard = SendOnDrop(self.dropped.lock().unwrap().take());
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_dispatch_aborts_outstanding_sub_requests() {
        let (tx, rx) = oneshot::channel();
        let mut table = RouteTable::new();
        table
            .route(
                "/hang",
                Arc::new(HangingHandler {
                    dropped: std::sync::Mutex::new(Some(tx)),
                }),
            )
            .unwrap();
        let d = dispatcher(table);

        let batch = BatchRequest::from_query("h=/hang").unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            d.dispatch(batch, &CallerContext::default()),
        )
        .await;
        assert!(result.is_err());

        // The aborted task drops the handler future, which fires the guard.
        rx.await.expect("sub-request task was not aborted");
    }

    #[tokio::test]
    async fn identical_batches_have_identical_shape() {
        let mut table = RouteTable::new();
        text_route(&mut table, "/foo", "foo");
        let d = dispatcher(table);

        let first = dispatch_query(&d, "f=/foo&m=/missing").await;
        let second = dispatch_query(&d, "f=/foo&m=/missing").await;
        assert_eq!(first, second);
    }

    #[test]
    fn json_bodies_embed_verbatim_and_text_is_quoted() {
        let entries = vec![
            (
                "json".to_string(),
                SubOutcome::Success(SubResponse::json(
                    StatusCode::OK,
                    &br#"{"ok":true}"#[..],
                )),
            ),
            (
                "num".to_string(),
                SubOutcome::Success(SubResponse::text(StatusCode::OK, "42")),
            ),
            (
                "text".to_string(),
                SubOutcome::Success(SubResponse::text(StatusCode::OK, "plain text")),
            ),
        ];
        let body = BatchResponse { entries }.to_json_body();
        assert_eq!(
            &body[..],
            br#"{"json":{"ok":true},"num":42,"text":"plain text"}"#
        );
    }

    #[test]
    fn non_utf8_bodies_are_base64_wrapped() {
        let entries = vec![(
            "bin".to_string(),
            SubOutcome::Success(SubResponse {
                status: StatusCode::OK,
                content_type: Some("application/octet-stream".to_string()),
                body: Bytes::from_static(&[0xff, 0xfe, 0x00]),
            }),
        )];
        let body = BatchResponse { entries }.to_json_body();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["bin"]["encoding"], "base64");
        assert_eq!(v["bin"]["body"], STANDARD.encode([0xff, 0xfe, 0x00]));
    }

    #[test]
    fn labels_needing_escapes_are_quoted() {
        let entries = vec![(
            "we\"ird".to_string(),
            SubOutcome::UnresolvedRoute,
        )];
        let body = BatchResponse { entries }.to_json_body();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["we\"ird"]["error"], "UnresolvedRoute");
    }
}
