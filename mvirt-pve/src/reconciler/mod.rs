//! Reconciliation of VirtualMachine declarations with Proxmox.
//!
//! A `Connector` resolves the provider configuration for a declaration and
//! hands out an `ExternalClient`. The caller then observes the VM and, based
//! on the observation, performs at most one of create, update or delete.

pub mod drift;
pub mod finalizer;
pub mod vm;

use async_trait::async_trait;
use thiserror::Error;

use crate::clients::PveError;
use crate::resources::VirtualMachine;
use crate::store::StoreError;

/// Result of observing the remote VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
}

impl ExternalObservation {
    pub const fn absent() -> Self {
        Self {
            resource_exists: false,
            resource_up_to_date: false,
        }
    }
}

/// Errors surfaced by a reconciliation attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cannot get ProviderConfig {name}: {source}")]
    ProviderConfig { name: String, source: StoreError },

    #[error("cannot get credentials secret {namespace}/{name}: {source}")]
    Secret {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("invalid credentials secret: {0}")]
    Credentials(String),

    #[error("cannot create Proxmox client: {0}")]
    Connect(PveError),

    #[error("cannot observe VM: {0}")]
    Observe(PveError),

    #[error("cannot create VM: {0}")]
    Create(PveError),

    #[error("cannot update VM: {0}")]
    Update(PveError),

    #[error("cannot delete VM: {0}")]
    Delete(PveError),

    #[error("cannot add finalizer: {0}")]
    AddFinalizer(StoreError),

    #[error("failed to remove finalizer after VM deletion: {0}")]
    RemoveFinalizer(StoreError),
}

impl ReconcileError {
    /// Whether the scheduler should requeue with backoff.
    ///
    /// Only contract violations (a record of the wrong kind) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::ProviderConfig { source, .. }
            | ReconcileError::Secret { source, .. }
            | ReconcileError::AddFinalizer(source)
            | ReconcileError::RemoveFinalizer(source) => source.is_retryable(),
            _ => true,
        }
    }

    /// The Proxmox error behind this failure, if any.
    pub fn remote(&self) -> Option<&PveError> {
        match self {
            ReconcileError::Connect(e)
            | ReconcileError::Observe(e)
            | ReconcileError::Create(e)
            | ReconcileError::Update(e)
            | ReconcileError::Delete(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Produces an `ExternalClient` for one declaration.
#[async_trait]
pub trait Connector: Send + Sync {
    type External: ExternalClient;

    async fn connect(&self, vm: &VirtualMachine) -> Result<Self::External>;
}

/// Operations on the remote VM backing one declaration.
///
/// Implementations mutate only the declaration's status and finalizers.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Read the remote VM and report existence and drift.
    async fn observe(&self, vm: &mut VirtualMachine) -> Result<ExternalObservation>;

    /// Create the remote VM. Only valid after an observation reported absence.
    async fn create(&self, vm: &mut VirtualMachine) -> Result<()>;

    /// Push the updatable fields to the remote VM.
    async fn update(&self, vm: &mut VirtualMachine) -> Result<()>;

    /// Delete the remote VM and release the finalizer.
    async fn delete(&self, vm: &mut VirtualMachine) -> Result<()>;

    /// Release the finalizer without touching the remote VM.
    ///
    /// A declaration whose deletion was requested and that has no finalizers
    /// left is written once so the store drops it.
    async fn release(&self, vm: &mut VirtualMachine) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
