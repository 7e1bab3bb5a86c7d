//! Forwarding of inference requests to the resolved upstream.

use axum::body::Body;
use axum::http::{HeaderName, Method};
use axum::response::Response;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::providers::apireq::{build_headers, join_endpoint};
use crate::providers::{Error, ErrorKind};
use crate::registry::ResolvedConfig;

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Merges `overlay` into `base`. Objects are merged key by key at every
/// depth; anything else in `overlay` replaces what is in `base`.
pub(crate) fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Sends `body` with the route's overrides merged in to the resolved
/// upstream and streams the response back.
pub(crate) async fn forward(
    client: &Client,
    method: Method,
    path_and_query: &str,
    body: Value,
    resolved: &ResolvedConfig,
) -> Result<Response, Error> {
    let mut body = body;
    merge_json(&mut body, Value::Object(resolved.body.clone()));

    let url = join_endpoint(&resolved.api_base, path_and_query)
        .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;

    let mut headers = build_headers(&resolved.headers, resolved.api_key.as_deref())?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    debug!(url = %url, provider = ?resolved.provider, "forwarding request");

    let payload = serde_json::to_vec(&body)
        .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;

    let res = client
        .request(method, url)
        .headers(headers)
        .body(payload)
        .send()
        .await?;

    let mut builder = Response::builder().status(res.status());

    for (name, value) in res.headers() {
        if is_hop_by_hop(name) || name == CONTENT_LENGTH {
            continue;
        }

        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(res.bytes_stream()))
        .map_err(|e| Error::from_source(ErrorKind::UnexpectedResponse, Box::new(e)))
}
