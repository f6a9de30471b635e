// Error types
// -----------
// `StoreError` is what the permission store (the Drive API, or a fake in
// tests) reports. `TransferError` is the coordinator's taxonomy: one variant
// per step, each keeping the store error as its source so the remote message
// reaches the caller unchanged.

use thiserror::Error;

/// Failure reported by a `PermissionStore` call.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The remote API answered with a non-success status.
    #[error("API request failed: {status} - {message}")]
    Api { status: u16, message: String },

    /// Transport or body decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The request URL could not be built from the base URL and ids.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Create an API error
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        StoreError::Api {
            status,
            message: message.into(),
        }
    }
}

/// Why the lookup step could not produce a permission id.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("User {recipient} does not have access to file {resource_id}")]
    NoAccess {
        recipient: String,
        resource_id: String,
    },

    #[error("listing permissions failed: {0}")]
    Store(#[source] StoreError),
}

/// Failure of an ownership transfer, tagged with the step that failed.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("granting pending-owner access to {recipient} failed")]
    Grant {
        recipient: String,
        #[source]
        source: StoreError,
    },

    #[error("permission lookup failed")]
    Lookup(#[source] LookupError),

    #[error("promoting permission {permission_id} to owner failed")]
    Promotion {
        permission_id: String,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    /// Short name of the step that failed, used in log lines.
    pub fn step(&self) -> &'static str {
        match self {
            TransferError::Grant { .. } => "grant",
            TransferError::Lookup(_) => "lookup",
            TransferError::Promotion { .. } => "promotion",
        }
    }

    /// True when the grant step already went through, meaning the
    /// recipient holds a writer + pending-owner permission.
    pub fn left_pending_grant(&self) -> bool {
        !matches!(self, TransferError::Grant { .. })
    }
}
