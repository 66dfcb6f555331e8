//! ResourceStore trait definition.

use async_trait::async_trait;

use super::error::Result;
use crate::resources::{ProviderConfig, Secret, VirtualMachine};

/// Typed access to the records the provider works with.
///
/// Writes are checked against `metadata.resource_version`; a stale write
/// fails with `StoreError::VersionMismatch`. Updating a `VirtualMachine`
/// whose deletion was requested and whose finalizers are empty removes it.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// List all VirtualMachine declarations.
    async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>>;

    /// Get a VirtualMachine declaration by name.
    async fn get_virtual_machine(&self, name: &str) -> Result<Option<VirtualMachine>>;

    /// Replace a VirtualMachine (metadata, spec and status).
    ///
    /// Returns the stored record with its new resource version.
    async fn update_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// Replace only the status of a VirtualMachine.
    async fn update_virtual_machine_status(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// Get a ProviderConfig by name.
    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>>;

    /// Get a Secret by namespace and name.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}
