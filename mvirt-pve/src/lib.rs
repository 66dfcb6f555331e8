//! mvirt-pve: Proxmox provider for mvirt.
//!
//! Reconciles `VirtualMachine` declarations with QEMU guests on a Proxmox VE
//! node: observes the remote VM, creates or updates it when it is missing or
//! drifted, and deletes it behind a finalizer when the declaration goes away.

pub mod agent;
pub mod clients;
pub mod reconciler;
pub mod resources;
pub mod store;

pub use agent::{Agent, AgentConfig, Outcome};
pub use clients::{PveClient, PveError, SessionCache};
pub use reconciler::vm::{VmConnector, VmExternal};
pub use reconciler::{Connector, ExternalClient, ExternalObservation, ReconcileError};
pub use store::{FileStore, MemoryStore, ResourceStore, StoreError};
