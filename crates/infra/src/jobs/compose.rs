//! Job -> outbound request translation.
//!
//! Pure: no I/O, deterministic for a given job.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use relayq_core::{HttpVerb, Job};

const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

/// A fully-described outbound request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSpec {
    pub method: HttpVerb,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Query-string pairs, in payload key order.
    pub query: Vec<(String, String)>,
    /// JSON body; only set for verbs that carry one.
    pub body: Option<Value>,
}

/// Build the request that delivers `job`.
///
/// POST and PUT send the payload as a JSON body. GET and DELETE send it in
/// the query string and never carry a body.
pub fn compose(job: &Job) -> RequestSpec {
    let mut headers = job.headers.clone();

    if job.http_verb.carries_body() {
        if !headers.keys().any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE)) {
            headers.insert(CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
        }
        return RequestSpec {
            method: job.http_verb,
            url: job.callback_url.clone(),
            headers,
            query: Vec::new(),
            body: Some(job.payload.clone()),
        };
    }

    RequestSpec {
        method: job.http_verb,
        url: job.callback_url.clone(),
        headers,
        query: query_pairs(&job.payload),
        body: None,
    }
}

fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), query_value(value)))
            .collect(),
        other => vec![("payload".to_string(), other.to_string())],
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
