//! vSphere client errors

use thiserror::Error;

/// Errors that can occur when interacting with the vSphere backend
#[derive(Debug, Error)]
pub enum VsphereError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Authentication failed (bad credentials, expired session, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The backend is unreachable
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Inventory object not found (VM, resource pool, folder, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backend task failed
    #[error("Task failed: {0}")]
    Task(String),

    /// Invalid request (e.g. missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
