//! In-memory ResourceStore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::error::{Result, StoreError};
use super::traits::ResourceStore;
use super::{write_virtual_machine, Written};
use crate::resources::{ProviderConfig, Secret, VirtualMachine};

/// ResourceStore backed by hash maps. Counts writes so callers can assert
/// how often a reconciliation touched the store.
#[derive(Default)]
pub struct MemoryStore {
    virtual_machines: RwLock<HashMap<String, VirtualMachine>>,
    provider_configs: RwLock<HashMap<String, ProviderConfig>>,
    secrets: RwLock<HashMap<(String, String), Secret>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a VirtualMachine, bypassing version checks.
    pub async fn insert_virtual_machine(&self, mut vm: VirtualMachine) -> VirtualMachine {
        if vm.metadata.resource_version == 0 {
            vm.metadata.resource_version = 1;
        }
        self.virtual_machines
            .write()
            .await
            .insert(vm.metadata.name.clone(), vm.clone());
        vm
    }

    pub async fn insert_provider_config(&self, pc: ProviderConfig) {
        self.provider_configs
            .write()
            .await
            .insert(pc.metadata.name.clone(), pc);
    }

    pub async fn insert_secret(&self, secret: Secret) {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone(),
        );
        self.secrets.write().await.insert(key, secret);
    }

    /// Mark a VirtualMachine for deletion, as an external actor would.
    ///
    /// Removes it right away when it carries no finalizers.
    pub async fn request_deletion(&self, name: &str) -> Result<()> {
        let mut vms = self.virtual_machines.write().await;
        let vm = vms
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("VirtualMachine {name}")))?;
        if vm.metadata.finalizers.is_empty() {
            vms.remove(name);
            return Ok(());
        }
        vm.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
        vm.metadata.resource_version = vm.metadata.resource_version.saturating_add(1);
        Ok(())
    }

    /// Number of successful VirtualMachine writes (spec or status).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn write(&self, vm: &VirtualMachine, status_only: bool) -> Result<VirtualMachine> {
        let mut vms = self.virtual_machines.write().await;
        let name = &vm.metadata.name;
        let stored = vms
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("VirtualMachine {name}")))?;

        let written = write_virtual_machine(stored, vm, status_only)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        match written {
            Written::Stored(next) => {
                vms.insert(name.clone(), next.clone());
                Ok(next)
            }
            Written::Removed(last) => {
                vms.remove(name);
                Ok(last)
            }
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let mut vms: Vec<_> = self
            .virtual_machines
            .read()
            .await
            .values()
            .cloned()
            .collect();
        vms.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(vms)
    }

    async fn get_virtual_machine(&self, name: &str) -> Result<Option<VirtualMachine>> {
        Ok(self.virtual_machines.read().await.get(name).cloned())
    }

    async fn update_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.write(vm, false).await
    }

    async fn update_virtual_machine_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.write(vm, true).await
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>> {
        Ok(self.provider_configs.read().await.get(name).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
