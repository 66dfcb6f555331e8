//! Declarative store abstraction for the provider.
//!
//! The reconciler reads `VirtualMachine`, `ProviderConfig` and `Secret`
//! records through this seam and writes back only finalizers and status.
//!
//! # Architecture
//!
//! ```text
//! Agent / VmConnector → Arc<dyn ResourceStore>
//!                           ↓
//!                     store.get_provider_config(name)       // Reads
//!                     store.update_virtual_machine(&vm)     // Writes (version-checked)
//! ```
//!
//! Two backends exist: `MemoryStore` for tests and embedding, and
//! `FileStore`, a directory of JSON documents used by the daemon.

mod error;
mod file;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use traits::ResourceStore;

use crate::resources::VirtualMachine;

/// Result of writing a VirtualMachine over its stored copy.
pub(crate) enum Written {
    /// The record was stored with a new resource version.
    Stored(VirtualMachine),
    /// Deletion was requested and the last finalizer is gone.
    Removed(VirtualMachine),
}

/// Shared write rules for all backends.
///
/// The deletion timestamp cannot be changed through an update, and a
/// status-only write leaves metadata and spec untouched.
pub(crate) fn write_virtual_machine(
    stored: &VirtualMachine,
    incoming: &VirtualMachine,
    status_only: bool,
) -> Result<Written> {
    if incoming.metadata.resource_version != stored.metadata.resource_version {
        return Err(StoreError::VersionMismatch {
            expected: stored.metadata.resource_version,
            actual: incoming.metadata.resource_version,
        });
    }

    let mut next = if status_only {
        VirtualMachine {
            status: incoming.status.clone(),
            ..stored.clone()
        }
    } else {
        incoming.clone()
    };
    next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
    next.metadata.resource_version = stored.metadata.resource_version.saturating_add(1);

    if next.metadata.deletion_requested() && next.metadata.finalizers.is_empty() {
        Ok(Written::Removed(next))
    } else {
        Ok(Written::Stored(next))
    }
}
