//! Drift detection between a declaration and the observed VM.
//!
//! Only fields exposed by `status/current` can be compared: the VM name
//! and its ID. Memory, cores, disks and NICs are not part of the runtime
//! status and are not checked.

use crate::clients::pve::ObservedState;
use crate::resources::VirtualMachineSpec;

/// True when every comparable field matches exactly.
pub fn is_up_to_date(desired: &VirtualMachineSpec, observed: &ObservedState) -> bool {
    observed.hostname == desired.name && observed.id == desired.vmid
}
