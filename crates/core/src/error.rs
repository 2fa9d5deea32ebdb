use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Result<T, E = PilotError> = std::result::Result<T, E>;

/// Errors surfaced to callers of apply and wait.
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid manifest #{index}: {reason}")]
    InvalidManifest { index: usize, reason: String },

    #[error("backend rejected {object}: {source}")]
    BackendRejected {
        object: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("timed out after {elapsed:?} waiting for {}", PendingList(.pending))]
    Timeout { elapsed: Duration, pending: Vec<PendingResource> },

    #[error("cancelled")]
    Cancelled,

    #[error("reading manifest input")]
    Input(#[source] std::io::Error),
}

impl PilotError {
    pub fn backend(object: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        PilotError::BackendRejected { object: object.into(), source: Box::new(source) }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, PilotError::Timeout { .. }) }

    pub fn is_cancelled(&self) -> bool { matches!(self, PilotError::Cancelled) }
}

/// A resource still pending when a wait timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResource {
    pub namespace: String,
    pub name: String,
    /// Last readiness-check error, kept for diagnostics only.
    pub last_error: Option<String>,
}

impl fmt::Display for PendingResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)?;
        } else {
            write!(f, "{}/{}", self.namespace, self.name)?;
        }
        if let Some(e) = &self.last_error {
            write!(f, " (last error: {})", e)?;
        }
        Ok(())
    }
}

struct PendingList<'a>(&'a [PendingResource]);

impl fmt::Display for PendingList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s): ", self.0.len())?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 { f.write_str(", ")?; }
            write!(f, "{}", p)?;
        }
        Ok(())
    }
}
