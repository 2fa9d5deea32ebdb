//! Allow-listed pruning of objects dropped from the manifest set.

use std::collections::BTreeSet;

use kube::core::GroupVersionKind;
use metrics::counter;
use pilot_core::{DryRunLevel, PilotError, Result};
use pilot_kubehub::{gvk_key, Backend, BackendError, ObjectRef};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::{last_applied, AppliedObject};

/// The only kinds prune may ever delete, as `(group, version, kind)`.
///
/// Anything else (Ingress, CRDs, Namespaces, ...) survives even when stale.
pub const PRUNE_ALLOWLIST: [(&str, &str, &str); 8] = [
    ("", "v1", "ConfigMap"),
    ("", "v1", "PersistentVolumeClaim"),
    ("", "v1", "Secret"),
    ("", "v1", "Service"),
    ("", "v1", "ServiceAccount"),
    ("apps", "v1", "DaemonSet"),
    ("apps", "v1", "Deployment"),
    ("batch", "v1", "CronJob"),
];

/// Whether objects of `group`/`kind` (any version) may be pruned.
pub fn is_prunable(group: &str, kind: &str) -> bool {
    PRUNE_ALLOWLIST.iter().any(|(g, _, k)| *g == group && *k == kind)
}

type Identity = (String, String, Option<String>, String);

fn identity(r: &ObjectRef) -> Identity {
    let (g, k, ns, n) = r.identity();
    (g.to_string(), k.to_string(), ns.map(|s| s.to_string()), n.to_string())
}

/// Delete live objects of allow-listed kinds in `namespaces` that an earlier
/// apply created (they carry the last-applied annotation) and that `applied`
/// no longer contains.
pub(crate) async fn prune<B: Backend + ?Sized>(
    backend: &B,
    applied: &[AppliedObject],
    namespaces: &BTreeSet<String>,
    dry_run: DryRunLevel,
) -> Result<Vec<ObjectRef>> {
    let keep: FxHashSet<Identity> = applied.iter().map(|a| identity(&a.object)).collect();
    let mut pruned = Vec::new();

    for (group, version, kind_name) in PRUNE_ALLOWLIST {
        let gvk = GroupVersionKind::gvk(group, version, kind_name);
        let kind = match backend.resolve(&gvk).await {
            Ok(k) => k,
            Err(BackendError::UnknownKind(_)) => {
                debug!(kind = %gvk_key(&gvk), "kind not served; nothing to prune");
                continue;
            }
            Err(e) => return Err(PilotError::backend(gvk_key(&gvk), e)),
        };

        for ns in namespaces {
            let scope = kind.namespaced.then_some(ns.as_str());
            let live = backend.list(&kind, scope).await.map_err(|e| PilotError::backend(gvk_key(&gvk), e))?;
            for obj in live {
                if last_applied(&obj).is_none() {
                    continue;
                }
                let Some(name) = obj.pointer("/metadata/name").and_then(|v| v.as_str()) else { continue };
                let obj_ns = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());
                let target = ObjectRef::new(&gvk, obj_ns, name);
                if keep.contains(&identity(&target)) {
                    continue;
                }
                if dry_run != DryRunLevel::Client {
                    backend
                        .delete(&kind, obj_ns, name, dry_run == DryRunLevel::Server)
                        .await
                        .map_err(|e| PilotError::backend(target.to_string(), e))?;
                }
                info!(object = %target, dry_run = %dry_run, "pruned");
                pruned.push(target);
            }
            if !kind.namespaced {
                break;
            }
        }
    }

    counter!("apply_pruned_total", pruned.len() as u64);
    Ok(pruned)
}
