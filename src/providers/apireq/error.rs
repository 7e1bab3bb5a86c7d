//! Wrapper around Reqwest's error type so failures can be matched exhaustively

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    ConnectFailed,
    /// The connection broke while a request or response body was in flight
    BodyInterrupted,
    DecodingFailed,
    RedirectPolicyViolated,
    TimedOut,
    UnknownReqwestError,
}

#[derive(Debug)]
pub(crate) struct Error {
    kind: ErrorKind,
    url: Option<String>,
    source: reqwest::Error,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::new(err)
    }
}

impl Error {
    pub(crate) fn new(err: reqwest::Error) -> Error {
        // Timeouts are also reported as connect or body errors, check first
        let kind = if err.is_timeout() {
            ErrorKind::TimedOut
        } else if err.is_connect() {
            ErrorKind::ConnectFailed
        } else if err.is_decode() {
            ErrorKind::DecodingFailed
        } else if err.is_body() {
            ErrorKind::BodyInterrupted
        } else if err.is_redirect() {
            ErrorKind::RedirectPolicyViolated
        } else {
            ErrorKind::UnknownReqwestError
        };

        // Query strings may carry credentials
        let url = err.url().map(|url| {
            let mut url = url.clone();
            url.set_query(None);
            url.to_string()
        });

        Error {
            kind,
            url,
            source: err,
        }
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.kind {
            ErrorKind::ConnectFailed => "connection failed",
            ErrorKind::BodyInterrupted => "transfer interrupted",
            ErrorKind::DecodingFailed => "decoding failed",
            ErrorKind::RedirectPolicyViolated => "redirect policy violated",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::UnknownReqwestError => "request failed",
        };

        match &self.url {
            Some(url) => write!(f, "{} ({})", what, url),
            None => f.write_str(what),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}
