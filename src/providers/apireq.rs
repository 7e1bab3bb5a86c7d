//! A utility module with helpers for making API requests and classifying
//! their failures.

mod error;
mod provider;

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

pub(crate) use error::Error as ReqwestError;
pub(crate) use provider::error_for_status;
pub(crate) use reqwest::Url;

use super::{Error, ErrorKind};

/// Appends `path` to `api_base`. Unlike [`Url::join`], a path prefix on the
/// base (e.g. `https://openrouter.ai/api`) is kept.
pub(crate) fn join_endpoint(api_base: &str, path: &str) -> Result<Url, url::ParseError> {
    let base = api_base.trim_end_matches('/');

    if path.starts_with('/') {
        Url::parse(&format!("{}{}", base, path))
    } else {
        Url::parse(&format!("{}/{}", base, path))
    }
}

/// Builds outbound headers from configured ones. A bearer token is only
/// synthesized when an API key is set and no authorization header was
/// configured by hand.
pub(crate) fn build_headers(
    headers: &BTreeMap<String, String>,
    api_key: Option<&str>,
) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;

        map.insert(name, value);
    }

    if let Some(api_key) = api_key {
        if !map.contains_key(AUTHORIZATION) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))?;
            value.set_sensitive(true);

            map.insert(AUTHORIZATION, value);
        }
    }

    Ok(map)
}
