//! Conversions between Reqwest errors, HTTP statuses and provider error types

use reqwest::StatusCode;
use thiserror::Error;

use crate::providers::apireq::{error::ErrorKind as ReqwestErrorKind, ReqwestError};
use crate::providers::{Error, ErrorKind};

impl From<ReqwestError> for Error {
    fn from(value: ReqwestError) -> Self {
        let kind: ErrorKind = match &value.kind() {
            ReqwestErrorKind::ConnectFailed | ReqwestErrorKind::BodyInterrupted => {
                ErrorKind::Connection
            }
            ReqwestErrorKind::DecodingFailed | ReqwestErrorKind::RedirectPolicyViolated => {
                ErrorKind::UnexpectedResponse
            }
            ReqwestErrorKind::TimedOut => ErrorKind::TimedOut,
            ReqwestErrorKind::UnknownReqwestError => ErrorKind::UnspecifiedError,
        };

        Error::from_source(kind, Box::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        ReqwestError::new(value).into()
    }
}

/// An unsuccessful status, with whatever the server put in the body
#[derive(Error, Debug)]
#[error("{status}: {detail}")]
pub(crate) struct StatusError {
    status: StatusCode,
    detail: String,
}

pub(crate) fn error_for_status(status: StatusCode, detail: String) -> Error {
    let kind = match status.as_u16() {
        400 | 409 | 422 => ErrorKind::BadRequest,
        401 | 403 => ErrorKind::Authentication,
        404 => ErrorKind::NotFound,
        429 => ErrorKind::ExcessUsage,
        500..=599 => ErrorKind::InternalError,
        _ => ErrorKind::UnspecifiedError,
    };

    let mut detail = detail;
    detail.truncate(512);

    Error::from_source(kind, Box::new(StatusError { status, detail }))
}
