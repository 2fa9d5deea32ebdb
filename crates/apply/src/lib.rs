//! Pilot apply: declarative apply of a concatenated manifest stream.
//!
//! The manifests are the whole desired state. Every object is applied with
//! conflicting fields overwritten, the namespace override (if any) is forced
//! onto namespaced objects, and with pruning enabled stale objects of the
//! allow-listed kinds are deleted afterwards.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use metrics::{counter, histogram};
use pilot_core::{config::Settings, ApplyRequest, DryRunLevel, PilotError, Result};
use pilot_kubehub::{Backend, ObjectRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

mod input;
mod manifest;
mod prune;

pub use input::{InputChannel, InputLease};
pub use manifest::Limits;
pub use prune::{is_prunable, PRUNE_ALLOWLIST};

use manifest::{parse_manifests, Manifest};

/// Annotation holding the configuration an object was last applied with.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// What an apply did to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Configured,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedObject {
    pub object: ObjectRef,
    pub action: Action,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub dry_run: DryRunLevel,
    /// In manifest order.
    pub objects: Vec<AppliedObject>,
    pub pruned: Vec<ObjectRef>,
}

impl ApplyReport {
    /// Objects created, configured or pruned.
    pub fn changed(&self) -> usize {
        self.objects.iter().filter(|o| o.action != Action::Unchanged).count() + self.pruned.len()
    }
}

/// Applies manifest sets against a backend.
pub struct Applier<B: ?Sized> {
    backend: Arc<B>,
    input: Arc<InputChannel>,
    limits: Limits,
}

impl<B: Backend + ?Sized> Applier<B> {
    /// Uses the process-wide input channel and limits from the environment.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, input: InputChannel::global(), limits: Limits::from(&Settings::from_env()) }
    }

    pub fn with_input(mut self, input: Arc<InputChannel>) -> Self {
        self.input = input;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn backend(&self) -> &Arc<B> { &self.backend }

    pub async fn apply(&self, req: ApplyRequest) -> Result<ApplyReport> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.apply_inner(req).await;
        match &res {
            Ok(report) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(
                    objects = report.objects.len(),
                    changed = report.changed(),
                    pruned = report.pruned.len(),
                    dry_run = %report.dry_run,
                    "apply finished"
                );
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_inner(&self, req: ApplyRequest) -> Result<ApplyReport> {
        req.validate()?;
        let ApplyRequest { manifests, dry_run, prune, namespace } = req;
        let manifests = manifests.ok_or_else(|| PilotError::InvalidRequest("no manifests".into()))?;

        // Held until this call returns, whichever way it returns.
        let mut lease = self.input.redirect(manifests).await;
        let data = lease.read_all().await.map_err(PilotError::Input)?;
        let docs = parse_manifests(&data, &self.limits)?;

        let mut report = ApplyReport { dry_run, ..Default::default() };
        if docs.is_empty() {
            debug!("manifest stream holds no objects; nothing to apply");
            return Ok(report);
        }

        for m in docs {
            let applied = self.apply_one(m, namespace.as_deref(), dry_run).await?;
            report.objects.push(applied);
        }

        if prune {
            let scope = self.prune_scope(&report.objects, namespace.as_deref());
            report.pruned = prune::prune(&*self.backend, &report.objects, &scope, dry_run).await?;
        }
        drop(lease);
        Ok(report)
    }

    async fn apply_one(&self, m: Manifest, ns_override: Option<&str>, dry_run: DryRunLevel) -> Result<AppliedObject> {
        let Manifest { gvk, name, namespace, mut body } = m;
        let kind = self
            .backend
            .resolve(&gvk)
            .await
            .map_err(|e| PilotError::backend(ObjectRef::new(&gvk, namespace.as_deref(), &name).to_string(), e))?;

        let ns = if kind.namespaced {
            Some(match (ns_override, namespace) {
                (Some(forced), _) => forced.to_string(),
                (None, Some(own)) => own,
                (None, None) => self.backend.default_namespace().to_string(),
            })
        } else {
            None
        };
        set_namespace(&mut body, ns.as_deref());
        let object = ObjectRef::new(&gvk, ns.as_deref(), &name);
        let config = stamp_last_applied(&mut body).map_err(|e| PilotError::backend(object.to_string(), e))?;

        let live = self
            .backend
            .get(&kind, ns.as_deref(), &name)
            .await
            .map_err(|e| PilotError::backend(object.to_string(), e))?;
        let action = match &live {
            None => Action::Created,
            Some(l) if last_applied(l) == Some(config.as_str()) && converged(&body, l) => Action::Unchanged,
            Some(_) => Action::Configured,
        };

        if action != Action::Unchanged && dry_run != DryRunLevel::Client {
            self.backend
                .apply(&kind, ns.as_deref(), &name, &body, dry_run == DryRunLevel::Server)
                .await
                .map_err(|e| PilotError::backend(object.to_string(), e))?;
        }
        debug!(object = %object, action = %action, dry_run = %dry_run, "object applied");
        Ok(AppliedObject { object, action })
    }

    fn prune_scope(&self, applied: &[AppliedObject], ns_override: Option<&str>) -> BTreeSet<String> {
        if let Some(ns) = ns_override {
            return BTreeSet::from([ns.to_string()]);
        }
        let mut scope: BTreeSet<String> = applied.iter().filter_map(|a| a.object.namespace.clone()).collect();
        if scope.is_empty() {
            scope.insert(self.backend.default_namespace().to_string());
        }
        scope
    }
}

fn set_namespace(body: &mut Json, ns: Option<&str>) {
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        match ns {
            Some(ns) => {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
            None => {
                meta.remove("namespace");
            }
        }
    }
}

/// Record the desired configuration on the object itself; returns the recorded value.
fn stamp_last_applied(body: &mut Json) -> serde_json::Result<String> {
    if let Some(annos) = body.pointer_mut("/metadata/annotations").and_then(|a| a.as_object_mut()) {
        annos.remove(LAST_APPLIED_ANNOTATION);
        if annos.is_empty() {
            if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove("annotations");
            }
        }
    }
    let config = serde_json::to_string(body)?;
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
        if let Some(annos) = annos.as_object_mut() {
            annos.insert(LAST_APPLIED_ANNOTATION.into(), Json::String(config.clone()));
        }
    }
    Ok(config)
}

pub(crate) fn last_applied(live: &Json) -> Option<&str> {
    live.pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(|v| v.as_str())
}

/// Every field of `desired` is present with the same value in `live`.
/// Extra live fields (status, server defaults) are ignored.
fn converged(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => d.iter().all(|(k, dv)| l.get(k).map_or(false, |lv| converged(dv, lv))),
        (d, l) => d == l,
    }
}
