//! `fanout-gateway` is a small HTTP service that turns one batch request into
//! many in-process sub-requests.
//!
//! One incoming call to `/batch` carries an ordered set of `label=path` query
//! pairs. Every path is resolved against the same route table that serves
//! normal requests, all matched handlers run concurrently, and the joined
//! results come back as a single JSON object keyed by the original labels.
//!
//! Core modules:
//! - [`config`]: gateway config manifest (YAML)
//! - [`routes`]: route table spec + matcher and the handler seam
//! - [`batch`]: batch parsing, fan-out/fan-in, response assembly
//! - [`server`]: axum server wiring

pub mod batch;
pub mod config;
pub mod routes;
pub mod server;
pub mod template;
