//! Pilot kubehub: the backend capability used by apply and readiness checks, and its kube-rs implementation.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{oneshot::pinned_kind, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors reported by a [`Backend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("kind not served by backend: {0}")]
    UnknownKind(String),

    #[error("namespace required for namespaced kind {0}")]
    NamespaceRequired(String),

    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("backend request failed")]
    Kube(#[source] kube::Error),

    #[error("encoding object")]
    Encode(#[from] serde_json::Error),
}

impl From<kube::Error> for BackendError {
    fn from(e: kube::Error) -> Self {
        counter!("backend_errors_total", 1u64);
        match e {
            kube::Error::Api(ae) => BackendError::Rejected { code: ae.code, message: ae.message },
            other => BackendError::Kube(other),
        }
    }
}

impl BackendError {
    pub fn is_not_found(&self) -> bool { matches!(self, BackendError::Rejected { code: 404, .. }) }
}

/// A kind the backend serves, with its scope.
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedKind {
    pub fn new(api_resource: ApiResource, namespaced: bool) -> Self { Self { api_resource, namespaced } }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.api_resource.group, &self.api_resource.version, &self.api_resource.kind)
    }

    pub fn key(&self) -> String { gvk_key(&self.gvk()) }
}

/// Reference to one object on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Version-independent identity: the same object is served under every version of its group.
    pub fn identity(&self) -> (&str, &str, Option<&str>, &str) {
        (self.group.as_str(), self.kind.as_str(), self.namespace.as_deref(), self.name.as_str())
    }

    pub fn gvk(&self) -> GroupVersionKind { GroupVersionKind::gvk(&self.group, &self.version, &self.kind) }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", gvk_key(&self.gvk()), ns, self.name),
            None => write!(f, "{} {}", gvk_key(&self.gvk()), self.name),
        }
    }
}

/// Capability to read and mutate declarative objects.
///
/// Objects travel as raw JSON so callers never need compiled-in types.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Namespace for namespaced objects that do not name one.
    fn default_namespace(&self) -> &str;

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, BackendError>;

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>, BackendError>;

    /// `namespace = None` lists across all namespaces for namespaced kinds.
    async fn list(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Result<Vec<Json>, BackendError>;

    /// Declaratively apply `body`, overwriting conflicting fields.
    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        body: &Json,
        dry_run: bool,
    ) -> Result<Json, BackendError>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str, dry_run: bool) -> Result<(), BackendError>;
}

/// [`Backend`] over a kube-rs client.
///
/// Kinds are discovered one at a time and only hits are cached, so a kind
/// that appears later (a CRD applied by an earlier call) is found on the next
/// lookup.
pub struct KubeBackend {
    client: Client,
    field_manager: String,
    kinds: RwLock<HashMap<String, ResolvedKind>>,
}

impl KubeBackend {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), kinds: RwLock::new(HashMap::new()) }
    }

    /// Connect with the ambient kubeconfig or in-cluster configuration.
    pub async fn try_default(field_manager: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, BackendError> {
        if !kind.namespaced {
            return Ok(Api::all_with(self.client.clone(), &kind.api_resource));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &kind.api_resource)),
            None => Err(BackendError::NamespaceRequired(kind.key())),
        }
    }
}

#[async_trait]
impl Backend for KubeBackend {
    fn default_namespace(&self) -> &str { self.client.default_namespace() }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, BackendError> {
        let key = gvk_key(gvk);
        if let Some(kind) = self.kinds.read().await.get(&key) {
            return Ok(kind.clone());
        }
        // Any served version resolves, not only the preferred one.
        let (ar, caps) = pinned_kind(&self.client, gvk).await.map_err(|e| lookup_error(&key, e))?;
        let kind = ResolvedKind::new(ar, matches!(caps.scope, Scope::Namespaced));
        info!(kind = %key, namespaced = kind.namespaced, "kind discovered");
        self.kinds.write().await.insert(key, kind.clone());
        Ok(kind)
    }

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>, BackendError> {
        let api = self.api(kind, namespace)?;
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Result<Vec<Json>, BackendError> {
        let api: Api<DynamicObject> = match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &kind.api_resource),
            _ => Api::all_with(self.client.clone(), &kind.api_resource),
        };
        let list = api.list(&ListParams::default()).await?;
        debug!(kind = %kind.key(), ns = ?namespace, count = list.items.len(), "listed objects");
        list.items.iter().map(|o| serde_json::to_value(o).map_err(BackendError::from)).collect()
    }

    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        body: &Json,
        dry_run: bool,
    ) -> Result<Json, BackendError> {
        let api = self.api(kind, namespace)?;
        let mut pp = PatchParams::apply(&self.field_manager).force();
        if dry_run {
            pp = pp.dry_run();
        }
        let obj = api.patch(name, &pp, &Patch::Apply(body)).await?;
        Ok(serde_json::to_value(&obj)?)
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str, dry_run: bool) -> Result<(), BackendError> {
        let api = self.api(kind, namespace)?;
        let dp = DeleteParams { dry_run, ..Default::default() };
        match api.delete(name, &dp).await.map_err(BackendError::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A group/version the server does not serve, or a kind missing from it, is
/// [`BackendError::UnknownKind`]; anything else is a real failure.
fn lookup_error(key: &str, e: kube::Error) -> BackendError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => BackendError::UnknownKind(key.to_string()),
        kube::Error::Discovery(_) => BackendError::UnknownKind(key.to_string()),
        other => BackendError::from(other),
    }
}

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Group/version/kind from an object's `apiVersion` and `kind`.
pub fn gvk_from_object(obj: &Json) -> Option<GroupVersionKind> {
    let api_version = obj.get("apiVersion")?.as_str()?;
    let kind = obj.get("kind")?.as_str()?;
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    Some(GroupVersionKind::gvk(group, version, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_formats_core_and_group() {
        assert_eq!(gvk_key(&GroupVersionKind::gvk("", "v1", "ConfigMap")), "v1/ConfigMap");
        assert_eq!(gvk_key(&GroupVersionKind::gvk("apps", "v1", "Deployment")), "apps/v1/Deployment");
    }

    #[test]
    fn gvk_from_object_splits_api_version() {
        let obj = serde_json::json!({"apiVersion": "batch/v1", "kind": "CronJob"});
        let gvk = gvk_from_object(&obj).unwrap();
        assert_eq!(gvk_key(&gvk), "batch/v1/CronJob");
        let core = serde_json::json!({"apiVersion": "v1", "kind": "Secret"});
        assert_eq!(gvk_from_object(&core).unwrap().group, "");
        assert!(gvk_from_object(&serde_json::json!({"kind": "Secret"})).is_none());
    }

    #[test]
    fn object_ref_display_and_identity() {
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        let r = ObjectRef::new(&gvk, Some("argocd"), "argocd-server");
        assert_eq!(r.to_string(), "apps/v1/Deployment argocd/argocd-server");
        let mut other = r.clone();
        other.version = "v1beta2".into();
        assert_eq!(r.identity(), other.identity());
        let ns = ObjectRef::new(&GroupVersionKind::gvk("", "v1", "Namespace"), None, "argocd");
        assert_eq!(ns.to_string(), "v1/Namespace argocd");
    }

    #[test]
    fn api_errors_map_to_rejected() {
        let ae = kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "configmaps \"x\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        };
        let e = BackendError::from(kube::Error::Api(ae));
        assert!(e.is_not_found());
        assert!(e.to_string().contains("not found"));
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: format!("{} for argoproj.io/v1alpha1", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn unserved_group_version_is_an_unknown_kind() {
        let key = "argoproj.io/v1alpha1/Application";
        match lookup_error(key, api_error(404, "NotFound")) {
            BackendError::UnknownKind(k) => assert_eq!(k, key),
            other => panic!("expected unknown kind, got {:?}", other),
        }
        // Permission problems are surfaced, not hidden as a missing kind.
        match lookup_error(key, api_error(403, "Forbidden")) {
            BackendError::Rejected { code, .. } => assert_eq!(code, 403),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
