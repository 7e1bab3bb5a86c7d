//! The registry decides where requests for a model go.
//!
//! The first time a model is requested, every configured provider is asked,
//! in the order they are declared, whether it can serve the model. The first
//! one that can produces a route, which is persisted under the storage root.
//! Later requests for the same model read the persisted route and never run
//! discovery again, until the route is explicitly forgotten.
//!
//! Routes only hold what discovery learned (the upstream model id, the
//! weights file). Credentials and per-provider headers and bodies are taken
//! from the live configuration each time a route is resolved, so a rotated
//! key takes effect without rediscovering anything.

pub(crate) mod locks;
pub(crate) mod populate;
pub(crate) mod resolver;
pub(crate) mod store;

use std::collections::BTreeMap;
use std::fmt::Write;

use thiserror::Error;

use crate::config::ConfigError;

pub(crate) use resolver::Resolver;
pub(crate) use store::{LocalWeights, ModelRoute, RouteStore, WeightsFile};

/// A provider that was asked and could not serve a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attempt {
    pub provider: String,
    pub reason: String,
}

fn describe_attempts(attempted: &[Attempt]) -> String {
    if attempted.is_empty() {
        return ", no providers are configured".to_string();
    }

    let mut out = String::from(", tried ");

    for (i, attempt) in attempted.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }

        let _ = write!(out, "{} ({})", attempt.provider, attempt.reason);
    }

    out
}

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("invalid model name")]
    SecurityRejection,
    #[error("{0}")]
    Validation(String),
    #[error("no provider can serve \"{model}\"{}", describe_attempts(.attempted))]
    NotFound {
        model: String,
        attempted: Vec<Attempt>,
    },
    #[error("the route for \"{model}\" is invalid: {reason}")]
    InvalidPersistedState { model: String, reason: String },
    #[error("failed to persist route: {0}")]
    Persistence(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend unavailable: {0}")]
    Backend(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[source] crate::providers::Error),
}

/// Everything needed to forward a request for a model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedConfig {
    pub provider: Option<String>,
    pub api_base: String,
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Map<String, serde_json::Value>,
}
