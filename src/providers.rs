//! Provider discovery: finding a backend for a model name nobody has asked
//! for before.
//!
//! Every configured provider is one of two kinds (see [`crate::config::Provider`]):
//! - Remote listing: an OpenAI-compatible service. Its `/v1/models` listing is
//!   searched for the requested model, either by id or by the hub identifier
//!   some services publish alongside their own ids.
//! - Local quantized: the requested name is treated as a hub repository. The
//!   quantized variants tagged against it are scored, the best weights file is
//!   downloaded, and an inference binary is spawned to serve it.
//!
//! Discovery never fails with an error. Each strategy reports a
//! [`DiscoveryOutcome`] and the resolver moves on to the next provider unless
//! the outcome is a match.
//!
//! ## Error Handling
//!
//! Upstream calls (hub listings, model listings, the proxied forward) share the
//! [`Error`] type. The [`ErrorKind`] enum provides an indication of the
//! category of error that was raised.

pub(crate) mod apireq;
pub(crate) mod hub;
pub(crate) mod local;
pub(crate) mod remote;

use std::error::Error as StdError;
use std::fmt;

use crate::registry::ModelRoute;

/// General categories of errors returned by upstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// Failed to connect to the upstream service. This could be due to
    /// network issues like DNS resolution, connectivity issues, or routing
    /// problems.
    Connection,
    /// A request timed out.
    TimedOut,
    /// The credentials were rejected or are missing.
    Authentication,
    /// A rate limit was reached or a quota was exceeded.
    ExcessUsage,
    /// The requested resource was not found.
    NotFound,
    /// The request was malformed. This often corresponds to errors with HTTP
    /// status codes in the 400s.
    BadRequest,
    /// The server encountered an error. This often corresponds to errors with
    /// HTTP status codes in the 500s.
    InternalError,
    /// A response was unable to be deserialized, malformed, or otherwise
    /// violated the assumptions of the client.
    UnexpectedResponse,
    /// Reading or writing a local file failed.
    Io,
    /// An error that does not fit into any of the other categories.
    UnspecifiedError,
}

#[derive(Debug)]
pub(crate) struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub(crate) fn from_kind(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub(crate) fn from_source(kind: ErrorKind, source: Box<dyn StdError + Send + Sync>) -> Error {
        Error {
            kind,
            source: Some(source),
        }
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn message(&self) -> &'static str {
        match self.kind {
            ErrorKind::Connection => "failed to connect to the upstream service",
            ErrorKind::TimedOut => "request timed out",
            ErrorKind::Authentication => "authentication failed or not provided",
            ErrorKind::ExcessUsage => "rate limit exceeded or quota crossed",
            ErrorKind::NotFound => "the requested resource was not found",
            ErrorKind::BadRequest => "the request was bad or malformed",
            ErrorKind::InternalError => "the server encountered an internal error",
            ErrorKind::UnexpectedResponse => "upstream response was unexpected or malformed",
            ErrorKind::Io => "a local file operation failed",
            ErrorKind::UnspecifiedError => "an unspecified error occurred",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message(), source),
            None => write!(f, "{}", self.message()),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| &**e as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::from_source(ErrorKind::Io, Box::new(value))
    }
}

/// The result of asking one provider to serve a model.
#[derive(Debug)]
pub(crate) enum DiscoveryOutcome {
    /// The provider can serve the model with this route.
    Matched(ModelRoute),
    /// The provider answered, but cannot serve the model.
    NoMatch(String),
    /// The provider could not be asked (network, parse or spawn failure).
    TransientFailure(String),
}
