//! Top-level error taxonomy, mapping each failure category onto a Rocket response.
//!
//! Handlers that can fail for one of these reasons return `Result<_, CoreError>`
//! instead of hand-building `(Status, Json<Value>)` tuples; `CoreError`'s
//! `Responder` impl builds the same `{ "error": ..., "details": ... }` shape
//! the rest of the API uses.

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::{json, Json};
use rocket::Request;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("external failure: {0}")]
    ExternalFailure(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("path escapes mount root: {0}")]
    PathEscape(String),

    #[error("restore mount unavailable: {0}")]
    MountUnavailable(String),
}

impl CoreError {
    fn status(&self) -> Status {
        match self {
            CoreError::Validation(_) => Status::BadRequest,
            CoreError::Precondition(_) => Status::Conflict,
            CoreError::ResourceExhaustion(_) => Status::ServiceUnavailable,
            CoreError::ExternalFailure(_) => Status::BadGateway,
            CoreError::Timeout(_) => Status::GatewayTimeout,
            CoreError::Internal(_) => Status::InternalServerError,
            CoreError::NotFound(_) => Status::NotFound,
            CoreError::PathEscape(_) => Status::BadRequest,
            CoreError::MountUnavailable(_) => Status::ServiceUnavailable,
        }
    }

    fn category(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "Validation",
            CoreError::Precondition(_) => "Precondition",
            CoreError::ResourceExhaustion(_) => "ResourceExhaustion",
            CoreError::ExternalFailure(_) => "ExternalFailure",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Internal(_) => "Internal",
            CoreError::NotFound(_) => "NotFound",
            CoreError::PathEscape(_) => "PathEscape",
            CoreError::MountUnavailable(_) => "MountUnavailable",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<crate::db_manager::DatabaseError> for CoreError {
    fn from(e: crate::db_manager::DatabaseError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Internal(format!("{e:#}"))
    }
}

impl From<crate::restore::browse::BrowseError> for CoreError {
    fn from(e: crate::restore::browse::BrowseError) -> Self {
        match e {
            crate::restore::browse::BrowseError::PathEscape(p) => CoreError::PathEscape(p),
            crate::restore::browse::BrowseError::NotFound(p) => CoreError::NotFound(p),
            crate::restore::browse::BrowseError::Io(e) => CoreError::Internal(e.to_string()),
        }
    }
}

impl From<crate::restore::mount::MountError> for CoreError {
    fn from(e: crate::restore::mount::MountError) -> Self {
        use crate::restore::mount::MountError;
        match e {
            MountError::DiskNotFound(id) => {
                CoreError::Validation(format!("backup disk {id} not found"))
            }
            MountError::DiskNotReady(id) => {
                CoreError::Precondition(format!("backup disk {id} has not completed yet"))
            }
            MountError::DevicePool(e) => CoreError::ResourceExhaustion(e.to_string()),
            MountError::NoFilesystemFound(id) => {
                CoreError::Validation(format!("no mountable filesystem found on backup disk {id}"))
            }
            other => CoreError::ExternalFailure(other.to_string()),
        }
    }
}

/// Shorthand used by handlers that still prefer the `(Status, Json<Value>)` idiom.
pub fn as_status_json(err: &CoreError) -> (Status, Json<rocket::serde::json::Value>) {
    (
        err.status(),
        Json(json!({ "error": err.category(), "details": err.to_string() })),
    )
}

impl<'r> Responder<'r, 'static> for CoreError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let (status, body) = as_status_json(&self);
        log::warn!("request error: {} ({})", self, status.code);
        body.respond_to(request).map(|mut r| {
            r.set_status(status);
            r
        })
    }
}
