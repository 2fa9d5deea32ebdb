//! Pilot persistence: multi-document YAML files on a pluggable filesystem.
//! Paths are relative to the store root; writes create parent directories.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use metrics::counter;
use pilot_core::manifest::{join_manifests, split_manifests};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Ordered multi-document files addressed by relative path.
pub trait ManifestStore: Send + Sync {
    /// True for existing files and directories.
    fn exists(&self, path: &Path) -> Result<bool>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or truncate `path`, creating parent directories as needed.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Write `data` only if nothing exists at `path`. Returns whether it already existed.
    fn write_if_absent(&self, path: &Path, data: &[u8]) -> Result<bool>;

    /// First `count` documents of `path`, in order. Fails when the file holds fewer.
    fn read_documents(&self, path: &Path, count: usize) -> Result<Vec<Vec<u8>>> {
        let data = self.read_file(path)?;
        let mut docs = split_manifests(&data);
        if docs.len() < count {
            bail!("expected at least {} manifests when reading '{}', found {}", count, path.display(), docs.len());
        }
        docs.truncate(count);
        Ok(docs)
    }

    fn write_documents(&self, path: &Path, docs: &[Vec<u8>]) -> Result<()> {
        self.write_file(path, &join_manifests(docs))
    }
}

/// Decode the first `count` documents of `path` as `T`.
pub fn read_yamls<T: DeserializeOwned>(store: &dyn ManifestStore, path: &Path, count: usize) -> Result<Vec<T>> {
    store
        .read_documents(path, count)?
        .iter()
        .enumerate()
        .map(|(i, doc)| decode_document(doc).with_context(|| format!("document #{} of '{}'", i, path.display())))
        .collect()
}

/// Encode every value as its own document and write them to `path`.
pub fn write_yamls<T: Serialize>(store: &dyn ManifestStore, path: &Path, values: &[T]) -> Result<()> {
    let docs = values.iter().map(encode_document).collect::<Result<Vec<_>>>()?;
    store.write_documents(path, &docs)
}

pub fn decode_document<T: DeserializeOwned>(doc: &[u8]) -> Result<T> {
    serde_yaml::from_slice(doc).context("parsing YAML document")
}

pub fn encode_document<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_yaml::to_string(value).context("serializing YAML document")?.into_bytes())
}

/// Store rooted at a directory. Paths are relative to the root and may not leave it.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root.join(normalize(path)?))
    }
}

impl ManifestStore for DirStore {
    fn exists(&self, path: &Path) -> Result<bool> {
        let full = self.resolve(path)?;
        match std::fs::metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to check if file exists at '{}'", path.display())),
        }
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        std::fs::read(&full).with_context(|| format!("reading '{}'", path.display()))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating parent of '{}'", path.display()))?;
        }
        std::fs::write(&full, data).with_context(|| format!("writing '{}'", path.display()))?;
        counter!("persist_write_total", 1u64);
        debug!(path = %path.display(), bytes = data.len(), "file written");
        Ok(())
    }

    fn write_if_absent(&self, path: &Path, data: &[u8]) -> Result<bool> {
        let full = self.resolve(path)?;
        if self.exists(path)? {
            return Ok(true);
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating parent of '{}'", path.display()))?;
        }
        // create_new closes the gap between the check above and the write.
        let created = create_new_with(&full, |f| f.write_all(data).and_then(|_| f.sync_all()))
            .with_context(|| format!("failed to create file at '{}'", path.display()))?;
        if created {
            counter!("persist_write_total", 1u64);
        }
        Ok(!created)
    }
}

/// Create `full` exclusively and fill it. `Ok(false)` when it already existed.
/// A fill error removes the file again, so a truncated file never passes for
/// a complete one.
fn create_new_with(full: &Path, fill: impl FnOnce(&mut std::fs::File) -> std::io::Result<()>) -> std::io::Result<bool> {
    let mut f = match std::fs::OpenOptions::new().write(true).create_new(true).open(full) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = fill(&mut f) {
        drop(f);
        if let Err(rm) = std::fs::remove_file(full) {
            warn!(path = %full.display(), error = %rm, "failed to remove partially written file");
        }
        return Err(e);
    }
    Ok(true)
}

/// In-memory store, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemStore {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().map(|f| f.keys().cloned().collect()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>>> {
        self.files.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl ManifestStore for MemStore {
    fn exists(&self, path: &Path) -> Result<bool> {
        let key = normalize(path)?;
        let files = self.lock()?;
        Ok(files.contains_key(&key) || files.keys().any(|p| p.starts_with(&key) && p != &key))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let key = normalize(path)?;
        self.lock()?.get(&key).cloned().ok_or_else(|| anyhow!("reading '{}': file does not exist", path.display()))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = normalize(path)?;
        self.lock()?.insert(key, data.to_vec());
        Ok(())
    }

    fn write_if_absent(&self, path: &Path, data: &[u8]) -> Result<bool> {
        let key = normalize(path)?;
        let mut files = self.lock()?;
        if files.contains_key(&key) || files.keys().any(|p| p.starts_with(&key)) {
            return Ok(true);
        }
        files.insert(key, data.to_vec());
        Ok(false)
    }
}

/// Relative path without `.`/`..`; a leading `/` is taken as the store root.
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(p) => out.push(p),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    bail!("path '{}' escapes the store root", path.display());
                }
            }
            Component::Prefix(_) => bail!("path '{}' has a drive prefix", path.display()),
        }
    }
    if out.as_os_str().is_empty() {
        bail!("empty path");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_paths_inside_root() {
        assert_eq!(normalize(Path::new("/apps/./a/../b.yaml")).unwrap(), PathBuf::from("apps/b.yaml"));
        assert!(normalize(Path::new("../etc/passwd")).is_err());
        assert!(normalize(Path::new("./")).is_err());
    }

    #[test]
    fn failed_fill_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("argocd.yaml");
        let err = create_new_with(&full, |f| {
            f.write_all(b"apiVersion: v1\nkind: Conf")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!full.exists());

        let store = DirStore::new(dir.path());
        assert!(!store.write_if_absent(Path::new("argocd.yaml"), b"kind: ConfigMap\n").unwrap());
        assert_eq!(store.read_file(Path::new("argocd.yaml")).unwrap(), b"kind: ConfigMap\n".to_vec());
    }

    #[test]
    fn mem_store_directories_exist() {
        let s = MemStore::new();
        s.write_file(Path::new("bootstrap/argo-cd/kustomization.yaml"), b"a: 1\n").unwrap();
        assert!(s.exists(Path::new("bootstrap")).unwrap());
        assert!(s.exists(Path::new("/bootstrap/argo-cd/kustomization.yaml")).unwrap());
        assert!(!s.exists(Path::new("apps")).unwrap());
        assert!(s.read_file(Path::new("apps/x.yaml")).is_err());
    }
}
