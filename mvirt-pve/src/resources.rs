//! Declarative records consumed by the provider.
//!
//! Three kinds live in the store:
//! - `VirtualMachine`: desired state for one Proxmox QEMU guest
//! - `ProviderConfig`: Proxmox endpoint and a reference to its credentials
//! - `Secret`: credential material referenced by a `ProviderConfig`

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed record kind held by the store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Value of the `kind` field for this record type.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

/// Metadata shared by every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    /// Set when deletion of the record has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

// =============================================================================
// References & policies
// =============================================================================

/// Reference to a cluster-scoped record by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
}

/// Reference to a namespaced secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// What happens to the Proxmox VM when its declaration is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete the VM on Proxmox.
    #[default]
    Delete,
    /// Leave the VM running on Proxmox, only forget about it.
    Orphan,
}

/// Actions the provider may take on the remote VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagementAction {
    Observe,
    Create,
    Update,
    Delete,
    LateInitialize,
    #[serde(rename = "*")]
    All,
}

/// Set of allowed management actions. An empty set means all actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagementPolicies(pub Vec<ManagementAction>);

impl ManagementPolicies {
    pub fn allows(&self, action: ManagementAction) -> bool {
        self.0.is_empty()
            || self
                .0
                .iter()
                .any(|a| *a == ManagementAction::All || *a == action)
    }
}

// =============================================================================
// VirtualMachine
// =============================================================================

/// Desired state of a Proxmox VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub provider_config_reference: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_reference: Option<SecretReference>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default)]
    pub management_policies: ManagementPolicies,

    /// Unique VM ID in Proxmox.
    pub vmid: u32,
    pub name: String,
    /// Memory size in MB.
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub cores: u32,
    /// CPU model (e.g. x86-64-v2-AES).
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub sockets: u32,
    /// CD-ROM drive, e.g. "local:iso/debian.iso,media=cdrom".
    #[serde(default)]
    pub ide2: String,
    /// e.g. "virtio,bridge=vmbr0".
    #[serde(default)]
    pub net0: String,
    #[serde(default)]
    pub numa: bool,
    /// e.g. "l26".
    #[serde(default)]
    pub ostype: String,
    #[serde(default)]
    pub scsi0: String,
    #[serde(default)]
    pub scsihw: String,
}

/// Observed state of a Proxmox VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl VirtualMachineStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Set a condition, replacing any existing one of the same type.
    ///
    /// The transition time is kept when nothing but the time changed.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) if existing.same_as(&condition) => {}
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl Resource for VirtualMachine {
    const KIND: &'static str = "VirtualMachine";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// =============================================================================
// Conditions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// Whether the VM is usable.
    Ready,
    /// Whether the last reconciliation succeeded.
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    Available,
    Unavailable,
    Creating,
    Deleting,
    ReconcileSuccess,
    ReconcileError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(kind: ConditionType, status: ConditionStatus, reason: ConditionReason) -> Self {
        Self {
            kind,
            status,
            reason,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn available() -> Self {
        Self::new(
            ConditionType::Ready,
            ConditionStatus::True,
            ConditionReason::Available,
        )
    }

    pub fn unavailable() -> Self {
        Self::new(
            ConditionType::Ready,
            ConditionStatus::False,
            ConditionReason::Unavailable,
        )
    }

    pub fn creating() -> Self {
        Self::new(
            ConditionType::Ready,
            ConditionStatus::False,
            ConditionReason::Creating,
        )
    }

    pub fn deleting() -> Self {
        Self::new(
            ConditionType::Ready,
            ConditionStatus::False,
            ConditionReason::Deleting,
        )
    }

    pub fn reconcile_success() -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::True,
            ConditionReason::ReconcileSuccess,
        )
    }

    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(
                ConditionType::Synced,
                ConditionStatus::False,
                ConditionReason::ReconcileError,
            )
        }
    }

    /// Equal in everything but the transition time.
    fn same_as(&self, other: &Condition) -> bool {
        self.kind == other.kind
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

// =============================================================================
// ProviderConfig
// =============================================================================

fn default_node() -> String {
    "pve".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Proxmox API endpoint, e.g. https://pve.example.com:8006
    pub endpoint: String,
    /// Proxmox node hosting the managed VMs.
    #[serde(default = "default_node")]
    pub node: String,
    pub credentials: SecretReference,
    /// Skip TLS certificate validation (self-signed Proxmox installs).
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub metadata: ObjectMeta,
    pub spec: ProviderConfigSpec,
}

impl Resource for ProviderConfig {
    const KIND: &'static str = "ProviderConfig";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// =============================================================================
// Secret
// =============================================================================

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

// Values are credentials; only the keys are printed.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Resource for Secret {
    const KIND: &'static str = "Secret";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_policies_default_allows_everything() {
        let policies = ManagementPolicies::default();
        assert!(policies.allows(ManagementAction::Create));
        assert!(policies.allows(ManagementAction::Delete));
    }

    #[test]
    fn management_policies_observe_only() {
        let policies = ManagementPolicies(vec![ManagementAction::Observe]);
        assert!(policies.allows(ManagementAction::Observe));
        assert!(!policies.allows(ManagementAction::Create));
        assert!(!policies.allows(ManagementAction::Update));
        assert!(!policies.allows(ManagementAction::Delete));
    }

    #[test]
    fn management_policies_wildcard() {
        let policies: ManagementPolicies = serde_json::from_str(r#"["*"]"#).unwrap();
        assert!(policies.allows(ManagementAction::Update));
    }

    #[test]
    fn set_condition_replaces_same_type() {
        let mut status = VirtualMachineStatus::default();
        status.set_condition(Condition::creating());
        status.set_condition(Condition::reconcile_success());
        status.set_condition(Condition::available());

        assert_eq!(status.conditions.len(), 2);
        let ready = status.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.reason, ConditionReason::Available);
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[test]
    fn set_condition_keeps_transition_time_when_unchanged() {
        let mut status = VirtualMachineStatus::default();
        let first = Condition::available();
        let first_time = first.last_transition_time;
        status.set_condition(first);

        let mut again = Condition::available();
        again.last_transition_time = first_time + chrono::Duration::seconds(30);
        status.set_condition(again);

        let ready = status.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, first_time);
    }

    #[test]
    fn virtual_machine_wire_format() {
        let json = r#"{
            "metadata": {"name": "web1", "finalizers": ["a"]},
            "spec": {
                "providerConfigReference": {"name": "default"},
                "vmid": 101,
                "name": "web1",
                "memory": 2048,
                "numa": true,
                "ostype": "l26"
            }
        }"#;
        let vm: VirtualMachine = serde_json::from_str(json).unwrap();
        assert_eq!(vm.spec.vmid, 101);
        assert_eq!(vm.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(vm.spec.provider_config_reference.name, "default");
        assert!(vm.spec.numa);
        assert_eq!(vm.metadata.finalizers, vec!["a".to_string()]);
        assert!(vm.status.conditions.is_empty());
    }

    #[test]
    fn provider_config_defaults() {
        let json = r#"{
            "metadata": {"name": "default"},
            "spec": {
                "endpoint": "https://pve:8006",
                "credentials": {"namespace": "crossplane-system", "name": "pve-creds"}
            }
        }"#;
        let pc: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(pc.spec.node, "pve");
        assert!(!pc.spec.insecure_skip_tls_verify);
    }

    #[test]
    fn secret_debug_hides_values() {
        let mut secret = Secret {
            metadata: ObjectMeta::named("pve-creds"),
            ..Default::default()
        };
        secret
            .data
            .insert("password".to_string(), "hunter2".to_string());
        let printed = format!("{secret:?}");
        assert!(printed.contains("password"));
        assert!(!printed.contains("hunter2"));
    }
}
