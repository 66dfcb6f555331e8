//! Directory-backed ResourceStore.
//!
//! Layout under the data directory:
//!
//! ```text
//! virtualmachines/<name>.json
//! providerconfigs/<name>.json
//! secrets/<namespace>/<name>.json
//! ```
//!
//! Every document carries a top-level `kind` field naming its record type.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::error::{Result, StoreError};
use super::traits::ResourceStore;
use super::{write_virtual_machine, Written};
use crate::resources::{ProviderConfig, Resource, Secret, VirtualMachine};

const VIRTUAL_MACHINES: &str = "virtualmachines";
const PROVIDER_CONFIGS: &str = "providerconfigs";
const SECRETS: &str = "secrets";

/// ResourceStore reading and writing JSON documents in a directory.
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on VirtualMachine documents.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the layout if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [VIRTUAL_MACHINES, PROVIDER_CONFIGS, SECRETS] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| StoreError::Internal(format!("create {dir}: {e}")))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn vm_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(VIRTUAL_MACHINES)
            .join(format!("{}.json", path_segment(name)?)))
    }

    async fn read<T: Resource>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Internal(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        decode(&path.display().to_string(), &bytes).map(Some)
    }

    async fn write<T: Resource>(&self, path: &Path, record: &T) -> Result<()> {
        let bytes = encode(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::Internal(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Internal(format!("rename {}: {e}", path.display())))
    }

    async fn write_vm(&self, vm: &VirtualMachine, status_only: bool) -> Result<VirtualMachine> {
        let _guard = self.write_lock.lock().await;
        let path = self.vm_path(&vm.metadata.name)?;
        let stored: VirtualMachine = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("VirtualMachine {}", vm.metadata.name)))?;

        match write_virtual_machine(&stored, vm, status_only)? {
            Written::Stored(next) => {
                self.write(&path, &next).await?;
                Ok(next)
            }
            Written::Removed(last) => {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    StoreError::Internal(format!("remove {}: {e}", path.display()))
                })?;
                Ok(last)
            }
        }
    }
}

/// A name usable as one path component inside the data directory.
fn path_segment(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Decode a document, checking its `kind` first.
fn decode<T: Resource>(key: &str, bytes: &[u8]) -> Result<T> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Internal(format!("parse {key}: {e}")))?;
    let found = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    if found != T::KIND {
        return Err(StoreError::WrongKind {
            key: key.to_string(),
            expected: T::KIND,
            found: found.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| StoreError::Internal(format!("decode {key}: {e}")))
}

fn encode<T: Resource>(record: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(record)
        .map_err(|e| StoreError::Internal(format!("encode {}: {e}", T::KIND)))?;
    if let Some(object) = value.as_object_mut() {
        object.insert("kind".to_string(), T::KIND.into());
    }
    serde_json::to_vec_pretty(&value)
        .map_err(|e| StoreError::Internal(format!("encode {}: {e}", T::KIND)))
}

#[async_trait]
impl ResourceStore for FileStore {
    async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let dir = self.root.join(VIRTUAL_MACHINES);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::Internal(format!("read_dir {}: {e}", dir.display())))?;

        let mut vms = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Internal(format!("read_dir {}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read::<VirtualMachine>(&path).await {
                Ok(Some(vm)) => vms.push(vm),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable declaration: {}", e),
            }
        }
        vms.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(vms)
    }

    async fn get_virtual_machine(&self, name: &str) -> Result<Option<VirtualMachine>> {
        self.read(&self.vm_path(name)?).await
    }

    async fn update_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.write_vm(vm, false).await
    }

    async fn update_virtual_machine_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.write_vm(vm, true).await
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>> {
        let path = self
            .root
            .join(PROVIDER_CONFIGS)
            .join(format!("{}.json", path_segment(name)?));
        self.read(&path).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let path = self
            .root
            .join(SECRETS)
            .join(path_segment(namespace)?)
            .join(format!("{}.json", path_segment(name)?));
        self.read(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(root: &Path, rel: &str, doc: serde_json::Value) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn vm_doc(name: &str, extra_meta: serde_json::Value) -> serde_json::Value {
        let mut metadata = json!({"name": name, "resourceVersion": 3});
        if let (Some(m), Some(extra)) = (metadata.as_object_mut(), extra_meta.as_object()) {
            m.extend(extra.clone());
        }
        json!({
            "kind": "VirtualMachine",
            "metadata": metadata,
            "spec": {
                "providerConfigReference": {"name": "default"},
                "vmid": 101,
                "name": name
            }
        })
    }

    #[tokio::test]
    async fn reads_all_three_kinds() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), "virtualmachines/web1.json", vm_doc("web1", json!({})));
        put(
            dir.path(),
            "providerconfigs/default.json",
            json!({
                "kind": "ProviderConfig",
                "metadata": {"name": "default"},
                "spec": {
                    "endpoint": "https://pve:8006",
                    "credentials": {"namespace": "infra", "name": "creds"}
                }
            }),
        );
        put(
            dir.path(),
            "secrets/infra/creds.json",
            json!({
                "kind": "Secret",
                "metadata": {"name": "creds", "namespace": "infra"},
                "data": {"username": "root@pam", "password": "secret"}
            }),
        );
        let store = FileStore::open(dir.path()).await.unwrap();

        let vms = store.list_virtual_machines().await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].spec.vmid, 101);

        let pc = store.get_provider_config("default").await.unwrap().unwrap();
        assert_eq!(pc.spec.credentials.name, "creds");

        let secret = store.get_secret("infra", "creds").await.unwrap().unwrap();
        assert_eq!(secret.get("username"), Some("root@pam"));

        assert!(store.get_provider_config("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_kind_is_a_contract_violation() {
        let dir = TempDir::new().unwrap();
        put(
            dir.path(),
            "providerconfigs/default.json",
            json!({"kind": "Secret", "metadata": {"name": "default"}, "data": {}}),
        );
        let store = FileStore::open(dir.path()).await.unwrap();

        let err = store.get_provider_config("default").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongKind { expected: "ProviderConfig", .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn update_persists_and_checks_version() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), "virtualmachines/web1.json", vm_doc("web1", json!({})));
        let store = FileStore::open(dir.path()).await.unwrap();

        let mut vm = store.get_virtual_machine("web1").await.unwrap().unwrap();
        vm.metadata.finalizers.push("finalizer.pve.mvirt.io".to_string());
        let updated = store.update_virtual_machine(&vm).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 4);

        let reread = store.get_virtual_machine("web1").await.unwrap().unwrap();
        assert_eq!(reread.metadata.finalizers.len(), 1);

        let err = store.update_virtual_machine(&vm).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn released_declaration_is_removed_from_disk() {
        let dir = TempDir::new().unwrap();
        put(
            dir.path(),
            "virtualmachines/web1.json",
            vm_doc(
                "web1",
                json!({
                    "deletionTimestamp": "2026-01-01T00:00:00Z",
                    "finalizers": ["finalizer.pve.mvirt.io"]
                }),
            ),
        );
        let store = FileStore::open(dir.path()).await.unwrap();

        let mut vm = store.get_virtual_machine("web1").await.unwrap().unwrap();
        vm.metadata.finalizers.clear();
        store.update_virtual_machine(&vm).await.unwrap();

        assert!(!dir.path().join("virtualmachines/web1.json").exists());
    }

    #[tokio::test]
    async fn names_cannot_leave_the_data_directory() {
        let dir = TempDir::new().unwrap();
        put(
            dir.path(),
            "outside.json",
            json!({"kind": "ProviderConfig", "metadata": {"name": "outside"}, "spec": {
                "endpoint": "https://pve:8006",
                "credentials": {"namespace": "infra", "name": "creds"}
            }}),
        );
        let store = FileStore::open(dir.path()).await.unwrap();

        let err = store.get_provider_config("../outside").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
        assert!(!err.is_retryable());

        assert!(matches!(
            store.get_secret("..", "outside").await.unwrap_err(),
            StoreError::InvalidName(_)
        ));
        assert!(matches!(
            store.get_virtual_machine("a/b").await.unwrap_err(),
            StoreError::InvalidName(_)
        ));

        let vm = VirtualMachine {
            metadata: crate::resources::ObjectMeta::named("../web1"),
            ..Default::default()
        };
        assert!(matches!(
            store.update_virtual_machine(&vm).await.unwrap_err(),
            StoreError::InvalidName(_)
        ));
    }

    #[tokio::test]
    async fn list_skips_unreadable_documents() {
        let dir = TempDir::new().unwrap();
        put(dir.path(), "virtualmachines/web1.json", vm_doc("web1", json!({})));
        std::fs::write(dir.path().join("virtualmachines/broken.json"), b"{not json").unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let vms = store.list_virtual_machines().await.unwrap();
        assert_eq!(vms.len(), 1);
    }
}
