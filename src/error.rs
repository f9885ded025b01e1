//! Error taxonomy for the sync engine.
//!
//! Cancellation is kept distinct from real failures so callers can persist a
//! resume point instead of reporting an error.
use reqwest::header::HeaderMap;
use std::fmt;
use thiserror::Error;

use crate::session::SessionError;

pub const HEADER_ACCEPTED_SCOPES: &str = "x-accepted-oauth-scopes";
pub const HEADER_GRANTED_SCOPES: &str = "x-oauth-scopes";
pub const HEADER_ACCEPTED_PERMISSIONS: &str = "x-accepted-github-permissions";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,

    #[error("listing {endpoint} page {page} failed: {source}{}", diagnostic_suffix(.source))]
    Api {
        endpoint: String,
        page: u32,
        #[source]
        source: ApiError,
    },

    #[error("storage {op} failed for {scope}: {source}")]
    Storage {
        op: &'static str,
        scope: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("table {table} has {columns} columns but a statement allows at most {ceiling} bound parameters")]
    BatchTooWide {
        table: String,
        columns: usize,
        ceiling: usize,
    },

    #[error("row {row} for table {table} has {got} values, expected {expected}")]
    RowWidth {
        table: String,
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("invalid sync target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    /// Builds a `map_err` adapter for a storage step.
    pub fn storage(op: &'static str, scope: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let scope = scope.into();
        move |source| SyncError::Storage { op, scope, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Scope/permission hint attached to a remote failure, if the API sent one.
    pub fn scope_diagnostic(&self) -> Option<&ScopeDiagnostic> {
        match self {
            SyncError::Api { source, .. } => source.diagnostic.as_ref(),
            _ => None,
        }
    }
}

fn diagnostic_suffix(err: &ApiError) -> String {
    match &err.diagnostic {
        Some(diag) if diag.is_insufficient() => format!(" ({})", diag),
        _ => String::new(),
    }
}

/// Failure reported by the remote listing API.
#[derive(Debug, Clone, Error)]
#[error("{}{message}", status_prefix(*.status))]
pub struct ApiError {
    pub status: Option<u16>,
    pub message: String,
    pub diagnostic: Option<ScopeDiagnostic>,
}

fn status_prefix(status: Option<u16>) -> String {
    status.map(|s| format!("status {}: ", s)).unwrap_or_default()
}

impl ApiError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Option<ScopeDiagnostic>) -> Self {
        self.diagnostic = diagnostic;
        self
    }
}

/// OAuth scopes and fine-grained permissions named by the API response
/// headers of a failed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeDiagnostic {
    /// Scopes the endpoint accepts; any one of them is sufficient.
    pub accepted_scopes: Vec<String>,
    /// Scopes the credential currently holds.
    pub granted_scopes: Vec<String>,
    /// Fine-grained permissions the endpoint accepts.
    pub accepted_permissions: Vec<String>,
}

impl ScopeDiagnostic {
    /// Returns `None` when the response carried none of the scope headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let list = |name: &str| -> Vec<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(split_header_list)
                .unwrap_or_default()
        };
        let diag = ScopeDiagnostic {
            accepted_scopes: list(HEADER_ACCEPTED_SCOPES),
            granted_scopes: list(HEADER_GRANTED_SCOPES),
            accepted_permissions: list(HEADER_ACCEPTED_PERMISSIONS),
        };
        if diag.accepted_scopes.is_empty()
            && diag.granted_scopes.is_empty()
            && diag.accepted_permissions.is_empty()
        {
            None
        } else {
            Some(diag)
        }
    }

    /// Accepted scopes the credential lacks. Empty when it already holds one
    /// of the accepted scopes.
    pub fn missing_scopes(&self) -> Vec<String> {
        let has_any = self
            .accepted_scopes
            .iter()
            .any(|s| self.granted_scopes.contains(s));
        if has_any {
            Vec::new()
        } else {
            self.accepted_scopes.clone()
        }
    }

    pub fn is_insufficient(&self) -> bool {
        !self.missing_scopes().is_empty() || !self.accepted_permissions.is_empty()
    }
}

impl fmt::Display for ScopeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self.missing_scopes();
        let mut parts = Vec::new();
        if !missing.is_empty() {
            let granted = if self.granted_scopes.is_empty() {
                "none".to_string()
            } else {
                self.granted_scopes.join(", ")
            };
            parts.push(format!(
                "credential needs one of the OAuth scopes [{}], granted [{}]",
                missing.join(", "),
                granted
            ));
        }
        if !self.accepted_permissions.is_empty() {
            parts.push(format!(
                "accepted fine-grained permissions [{}]",
                self.accepted_permissions.join(", ")
            ));
        }
        f.write_str(&parts.join("; "))
    }
}

fn split_header_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
