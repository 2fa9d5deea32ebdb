//! In-memory backend with call accounting.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::{ApiResource, GroupVersionKind};
use pilot_kubehub::{gvk_key, Backend, BackendError, ResolvedKind};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Resolve(String),
    Get(String),
    List(String),
    Apply { object: String, dry_run: bool },
    Delete { object: String, dry_run: bool },
}

impl Call {
    pub fn is_mutation(&self) -> bool { matches!(self, Call::Apply { .. } | Call::Delete { .. }) }
}

/// (group, kind, namespace, name); versions of one group share storage.
type Key = (String, String, Option<String>, String);

pub struct FakeBackend {
    served: Vec<(GroupVersionKind, bool)>,
    objects: Mutex<BTreeMap<Key, Json>>,
    calls: Mutex<Vec<Call>>,
    reject: Mutex<Option<String>>,
    revision: Mutex<u64>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let g = GroupVersionKind::gvk;
        Self {
            served: vec![
                (g("", "v1", "Namespace"), false),
                (g("", "v1", "ConfigMap"), true),
                (g("", "v1", "Secret"), true),
                (g("", "v1", "Service"), true),
                (g("", "v1", "ServiceAccount"), true),
                (g("", "v1", "PersistentVolumeClaim"), true),
                (g("apps", "v1", "Deployment"), true),
                (g("apps", "v1", "DaemonSet"), true),
                (g("networking.k8s.io", "v1", "Ingress"), true),
                (g("batch", "v1", "CronJob"), true),
                (g("batch", "v1beta1", "CronJob"), true),
                (g("apiextensions.k8s.io", "v1", "CustomResourceDefinition"), false),
            ],
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
            revision: Mutex::new(0),
        }
    }

    /// Stop serving every version of `group`/`kind`.
    pub fn unserve(mut self, group: &str, kind: &str) -> Self {
        self.served.retain(|(g, _)| !(g.group == group && g.kind == kind));
        self
    }

    /// Store `obj` as if it already existed on the backend.
    pub fn seed(&self, obj: Json) {
        let gvk = pilot_kubehub::gvk_from_object(&obj).expect("apiVersion and kind");
        let ns = obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let name = obj.pointer("/metadata/name").and_then(|v| v.as_str()).expect("name").to_string();
        self.objects.lock().unwrap().insert((gvk.group, gvk.kind, ns, name), obj);
    }

    pub fn object(&self, group: &str, kind: &str, ns: Option<&str>, name: &str) -> Option<Json> {
        let key = (group.to_string(), kind.to_string(), ns.map(|s| s.to_string()), name.to_string());
        self.objects.lock().unwrap().get(&key).cloned()
    }

    /// Edit a stored object behind the applier's back.
    pub fn mutate(&self, group: &str, kind: &str, ns: Option<&str>, name: &str, f: impl FnOnce(&mut Json)) {
        let key = (group.to_string(), kind.to_string(), ns.map(|s| s.to_string()), name.to_string());
        if let Some(obj) = self.objects.lock().unwrap().get_mut(&key) {
            f(obj);
        }
    }

    pub fn len(&self) -> usize { self.objects.lock().unwrap().len() }

    pub fn reject_apply_of(&self, name: &str) { *self.reject.lock().unwrap() = Some(name.to_string()); }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn mutations(&self) -> Vec<Call> { self.calls().into_iter().filter(Call::is_mutation).collect() }

    pub fn clear_calls(&self) { self.calls.lock().unwrap().clear(); }

    fn record(&self, call: Call) { self.calls.lock().unwrap().push(call); }

    fn key(kind: &ResolvedKind, ns: Option<&str>, name: &str) -> Key {
        (kind.api_resource.group.clone(), kind.api_resource.kind.clone(), ns.map(|s| s.to_string()), name.to_string())
    }

    fn describe(kind: &ResolvedKind, ns: Option<&str>, name: &str) -> String {
        match ns {
            Some(ns) => format!("{} {}/{}", kind.key(), ns, name),
            None => format!("{} {}", kind.key(), name),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn default_namespace(&self) -> &str { "default" }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, BackendError> {
        self.record(Call::Resolve(gvk_key(gvk)));
        self.served
            .iter()
            .find(|(g, _)| g == gvk)
            .map(|(g, namespaced)| ResolvedKind::new(ApiResource::from_gvk(g), *namespaced))
            .ok_or_else(|| BackendError::UnknownKind(gvk_key(gvk)))
    }

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>, BackendError> {
        self.record(Call::Get(Self::describe(kind, namespace, name)));
        Ok(self.objects.lock().unwrap().get(&Self::key(kind, namespace, name)).cloned())
    }

    async fn list(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Result<Vec<Json>, BackendError> {
        self.record(Call::List(kind.key()));
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((g, k, ns, _), _)| {
                *g == kind.api_resource.group && *k == kind.api_resource.kind && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        body: &Json,
        dry_run: bool,
    ) -> Result<Json, BackendError> {
        self.record(Call::Apply { object: Self::describe(kind, namespace, name), dry_run });
        if self.reject.lock().unwrap().as_deref() == Some(name) {
            return Err(BackendError::Rejected { code: 422, message: format!("{} is invalid", name) });
        }
        let mut stored = body.clone();
        // Server-populated fields, which must not count as drift.
        let mut rev = self.revision.lock().unwrap();
        *rev += 1;
        stored["metadata"]["resourceVersion"] = Json::String(rev.to_string());
        stored["status"] = serde_json::json!({});
        if !dry_run {
            self.objects.lock().unwrap().insert(Self::key(kind, namespace, name), stored.clone());
        }
        Ok(stored)
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str, dry_run: bool) -> Result<(), BackendError> {
        self.record(Call::Delete { object: Self::describe(kind, namespace, name), dry_run });
        if !dry_run {
            self.objects.lock().unwrap().remove(&Self::key(kind, namespace, name));
        }
        Ok(())
    }
}
