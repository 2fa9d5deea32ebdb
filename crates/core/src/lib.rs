//! Pilot core types: resource descriptors, request types and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod manifest;
pub mod telemetry;

pub use error::{PendingResource, PilotError, Result};

pub mod prelude {
    pub use super::{
        ApplyRequest, CheckContext, DryRunLevel, PilotError, ResourceDescriptor, Result, WaitRequest,
    };
}

/// Context handed to every readiness check.
#[derive(Debug, Clone)]
pub struct CheckContext {
    /// 1-based poll round the check runs in.
    pub round: u64,
    /// Cancellation token of the surrounding wait.
    pub cancel: CancellationToken,
}

/// Boxed readiness future. `Ok(false)` and `Err(_)` both mean "not ready yet".
pub type ReadinessFuture = BoxFuture<'static, anyhow::Result<bool>>;

/// Readiness predicate: `(ctx, backend, namespace, name) -> ready?`.
pub type ReadinessCheck<H> = Arc<dyn Fn(CheckContext, H, String, String) -> ReadinessFuture + Send + Sync>;

/// One watched object together with the predicate that decides its readiness.
///
/// Descriptors are compared by identity (`Arc::ptr_eq`), never by name, so two
/// descriptors for the same object are tracked as two entries.
pub struct ResourceDescriptor<H> {
    pub name: String,
    /// Empty for cluster-scoped kinds.
    pub namespace: String,
    check: ReadinessCheck<H>,
}

impl<H> ResourceDescriptor<H> {
    pub fn new<F, Fut>(name: impl Into<String>, namespace: impl Into<String>, check: F) -> Arc<Self>
    where
        F: Fn(CheckContext, H, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let check: ReadinessCheck<H> =
            Arc::new(move |ctx: CheckContext, h: H, ns: String, name: String| -> ReadinessFuture {
                check(ctx, h, ns, name).boxed()
            });
        Arc::new(Self { name: name.into(), namespace: namespace.into(), check })
    }

    /// Share an existing predicate between descriptors of the same kind.
    pub fn with_check(name: impl Into<String>, namespace: impl Into<String>, check: ReadinessCheck<H>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), namespace: namespace.into(), check })
    }

    pub fn check(&self, ctx: CheckContext, backend: H) -> ReadinessFuture {
        (self.check)(ctx, backend, self.namespace.clone(), self.name.clone())
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() { self.name.clone() } else { format!("{}/{}", self.namespace, self.name) }
    }
}

impl<H> fmt::Debug for ResourceDescriptor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Input of one readiness wait.
#[derive(Debug, Clone)]
pub struct WaitRequest<H> {
    pub resources: Vec<Arc<ResourceDescriptor<H>>>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl<H> WaitRequest<H> {
    pub fn new(resources: Vec<Arc<ResourceDescriptor<H>>>, poll_interval: Duration, timeout: Duration) -> Self {
        Self { resources, poll_interval, timeout }
    }

    /// Interval and timeout taken from `PILOT_WAIT_INTERVAL_MS` / `PILOT_WAIT_TIMEOUT_SECS`.
    pub fn with_defaults(resources: Vec<Arc<ResourceDescriptor<H>>>) -> Self {
        let s = config::Settings::from_env();
        Self::new(resources, s.poll_interval, s.wait_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(PilotError::InvalidRequest("no resources to wait for".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(PilotError::InvalidRequest("poll interval must be positive".into()));
        }
        if self.timeout < self.poll_interval {
            return Err(PilotError::InvalidRequest(format!(
                "timeout {:?} is shorter than poll interval {:?}",
                self.timeout, self.poll_interval
            )));
        }
        Ok(())
    }
}

/// How far an apply goes before stopping short of persisting changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunLevel {
    /// Live writes.
    #[default]
    None,
    /// Computed locally, nothing is sent to the backend except reads.
    Client,
    /// Sent to the backend flagged as dry-run.
    Server,
}

impl DryRunLevel {
    pub fn is_dry_run(self) -> bool { !matches!(self, DryRunLevel::None) }

    pub fn as_str(self) -> &'static str {
        match self {
            DryRunLevel::None => "none",
            DryRunLevel::Client => "client",
            DryRunLevel::Server => "server",
        }
    }
}

impl fmt::Display for DryRunLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for DryRunLevel {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(DryRunLevel::None),
            "client" => Ok(DryRunLevel::Client),
            "server" => Ok(DryRunLevel::Server),
            other => Err(PilotError::InvalidRequest(format!(
                "invalid dry-run level {:?} (expect none, client or server)",
                other
            ))),
        }
    }
}

/// Input of one declarative apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    /// Concatenated YAML documents. `None` is rejected, an empty payload is a no-op.
    pub manifests: Option<Vec<u8>>,
    pub dry_run: DryRunLevel,
    pub prune: bool,
    /// Forced onto every namespaced object when set.
    pub namespace: Option<String>,
}

impl ApplyRequest {
    pub fn new(manifests: impl Into<Vec<u8>>) -> Self {
        Self { manifests: Some(manifests.into()), ..Default::default() }
    }

    pub fn dry_run(mut self, level: DryRunLevel) -> Self {
        self.dry_run = level;
        self
    }

    pub fn prune(mut self, on: bool) -> Self {
        self.prune = on;
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.manifests.is_none() {
            return Err(PilotError::InvalidRequest("no manifests".into()));
        }
        if matches!(self.namespace.as_deref(), Some(ns) if ns.trim().is_empty()) {
            return Err(PilotError::InvalidRequest("namespace override must not be empty".into()));
        }
        Ok(())
    }
}
