//! Clients for remote hypervisor APIs.
//!
//! - pve: Proxmox VE management API (sessions, VM create/read/update/delete)
//! - session: optional cache of authenticated Proxmox sessions

pub mod pve;
pub mod session;

pub use pve::{Credentials, Endpoint, PveClient, PveError, Session};
pub use session::SessionCache;
