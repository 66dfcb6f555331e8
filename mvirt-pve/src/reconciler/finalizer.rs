//! Deletion-protection markers on declarations.
//!
//! Pure functions over the marker list; persisting the result is the
//! caller's job.

/// Marker placed on every VirtualMachine whose Proxmox VM is managed.
pub const FINALIZER: &str = "finalizer.pve.mvirt.io";

pub fn has(markers: &[String], name: &str) -> bool {
    markers.iter().any(|m| m == name)
}

/// Add `name` unless already present.
pub fn add(markers: &[String], name: &str) -> Vec<String> {
    let mut next = markers.to_vec();
    if !has(markers, name) {
        next.push(name.to_string());
    }
    next
}

/// Remove every occurrence of `name`. Absent markers are not an error.
pub fn remove(markers: &[String], name: &str) -> Vec<String> {
    markers.iter().filter(|m| *m != name).cloned().collect()
}
