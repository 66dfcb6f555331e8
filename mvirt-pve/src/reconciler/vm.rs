//! VM reconciler - reconciles VirtualMachine declarations with Proxmox.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::finalizer::{self, FINALIZER};
use super::{drift, Connector, ExternalClient, ExternalObservation, ReconcileError, Result};
use crate::clients::pve::{CreateVmPayload, PveBool, UpdateVmPayload, VmPowerState};
use crate::clients::{Credentials, Endpoint, PveClient, PveError, Session, SessionCache};
use crate::resources::{Condition, VirtualMachine, VirtualMachineSpec};
use crate::store::{ResourceStore, StoreError};

impl From<&VirtualMachineSpec> for CreateVmPayload {
    fn from(spec: &VirtualMachineSpec) -> Self {
        Self {
            vmid: spec.vmid,
            name: spec.name.clone(),
            memory: spec.memory,
            cores: spec.cores,
            cpu: spec.cpu.clone(),
            sockets: spec.sockets,
            ide2: spec.ide2.clone(),
            net0: spec.net0.clone(),
            numa: PveBool(spec.numa),
            ostype: spec.ostype.clone(),
            scsi0: spec.scsi0.clone(),
            scsihw: spec.scsihw.clone(),
        }
    }
}

impl From<&VirtualMachineSpec> for UpdateVmPayload {
    fn from(spec: &VirtualMachineSpec) -> Self {
        Self {
            name: spec.name.clone(),
            memory: spec.memory,
            cores: spec.cores,
            sockets: spec.sockets,
        }
    }
}

/// Ready condition for a Proxmox power state.
fn readiness(state: &VmPowerState) -> Condition {
    match state {
        VmPowerState::Running => Condition::available(),
        VmPowerState::Creating => Condition::creating(),
        VmPowerState::Deleting => Condition::deleting(),
        _ => Condition::unavailable(),
    }
}

/// Resolves ProviderConfig and credentials, then opens a Proxmox session.
pub struct VmConnector {
    store: Arc<dyn ResourceStore>,
    sessions: Arc<SessionCache>,
}

impl VmConnector {
    pub fn new(store: Arc<dyn ResourceStore>, sessions: Arc<SessionCache>) -> Self {
        Self { store, sessions }
    }
}

#[async_trait]
impl Connector for VmConnector {
    type External = VmExternal;

    async fn connect(&self, vm: &VirtualMachine) -> Result<VmExternal> {
        let pc_name = &vm.spec.provider_config_reference.name;
        info!(provider_config = %pc_name, "Fetching ProviderConfig");
        let pc = self
            .store
            .get_provider_config(pc_name)
            .await
            .and_then(|pc| pc.ok_or_else(|| StoreError::NotFound(format!("ProviderConfig {pc_name}"))))
            .map_err(|source| ReconcileError::ProviderConfig {
                name: pc_name.clone(),
                source,
            })?;

        let secret_ref = &pc.spec.credentials;
        info!(
            namespace = %secret_ref.namespace,
            name = %secret_ref.name,
            "Fetching credentials secret"
        );
        let secret = self
            .store
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
            .and_then(|s| {
                s.ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "Secret {}/{}",
                        secret_ref.namespace, secret_ref.name
                    ))
                })
            })
            .map_err(|source| ReconcileError::Secret {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
                source,
            })?;
        let credentials = Credentials::from_secret(&secret).map_err(ReconcileError::Credentials)?;

        let endpoint = Endpoint::from(&pc.spec);
        info!(endpoint = %endpoint.url, node = %pc.spec.node, "Creating Proxmox client");
        let session = self
            .sessions
            .get_or_connect(&endpoint, &credentials)
            .await
            .map_err(ReconcileError::Connect)?;

        Ok(VmExternal {
            client: PveClient::new(Arc::clone(&session), pc.spec.node.clone()),
            session,
            store: Arc::clone(&self.store),
            sessions: Arc::clone(&self.sessions),
            endpoint,
            credentials,
        })
    }
}

/// ExternalClient for one VirtualMachine, scoped to one reconciliation.
pub struct VmExternal {
    client: PveClient,
    session: Arc<Session>,
    store: Arc<dyn ResourceStore>,
    sessions: Arc<SessionCache>,
    endpoint: Endpoint,
    credentials: Credentials,
}

impl VmExternal {
    /// Drop a cached session the server no longer accepts.
    async fn check_session(&self, err: &PveError) {
        if err.is_unauthorized() {
            self.sessions
                .invalidate(&self.endpoint, &self.credentials, &self.session)
                .await;
        }
    }

    /// Persist `vm`, picking up the new resource version.
    async fn persist(&self, vm: &mut VirtualMachine) -> std::result::Result<(), StoreError> {
        *vm = self.store.update_virtual_machine(vm).await?;
        Ok(())
    }
}

#[async_trait]
impl ExternalClient for VmExternal {
    async fn observe(&self, vm: &mut VirtualMachine) -> Result<ExternalObservation> {
        let vmid = vm.spec.vmid;
        let observed = match self.client.get_status(vmid).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                info!(vmid, "VM not found on Proxmox; creation required");
                return Ok(ExternalObservation::absent());
            }
            Err(e) => {
                self.check_session(&e).await;
                return Err(ReconcileError::Observe(e));
            }
        };

        vm.status.state = Some(observed.status.as_str().to_string());
        vm.status.hostname = Some(observed.hostname.clone());
        vm.status.id = Some(observed.id);
        vm.status.set_condition(readiness(&observed.status));

        if !finalizer::has(&vm.metadata.finalizers, FINALIZER) {
            info!(vmid, "Adding finalizer");
            vm.metadata.finalizers = finalizer::add(&vm.metadata.finalizers, FINALIZER);
            self.persist(vm)
                .await
                .map_err(ReconcileError::AddFinalizer)?;
        }

        Ok(ExternalObservation {
            resource_exists: true,
            resource_up_to_date: drift::is_up_to_date(&vm.spec, &observed),
        })
    }

    async fn create(&self, vm: &mut VirtualMachine) -> Result<()> {
        info!(vmid = vm.spec.vmid, name = %vm.spec.name, "Creating VM on Proxmox");
        vm.status.set_condition(Condition::creating());

        let payload = CreateVmPayload::from(&vm.spec);
        match self.client.create(&payload).await {
            Ok(()) => {
                info!(vmid = vm.spec.vmid, "VM creation initiated successfully");
                Ok(())
            }
            Err(e) => {
                error!(vmid = vm.spec.vmid, "Failed to create VM: {}", e);
                self.check_session(&e).await;
                Err(ReconcileError::Create(e))
            }
        }
    }

    async fn update(&self, vm: &mut VirtualMachine) -> Result<()> {
        info!(vmid = vm.spec.vmid, "Updating VM on Proxmox");
        let payload = UpdateVmPayload::from(&vm.spec);
        if let Err(e) = self.client.update(vm.spec.vmid, &payload).await {
            error!(vmid = vm.spec.vmid, "Failed to update VM: {}", e);
            self.check_session(&e).await;
            return Err(ReconcileError::Update(e));
        }
        Ok(())
    }

    async fn delete(&self, vm: &mut VirtualMachine) -> Result<()> {
        let vmid = vm.spec.vmid;
        info!(vmid, "Deleting VM on Proxmox");
        vm.status.set_condition(Condition::deleting());

        match self.client.delete(vmid).await {
            Ok(()) => info!(vmid, "VM deletion successfully initiated"),
            Err(e) if e.is_not_found() => info!(vmid, "VM already deleted on Proxmox"),
            Err(e) => {
                error!(vmid, "Failed to delete VM: {}", e);
                self.check_session(&e).await;
                return Err(ReconcileError::Delete(e));
            }
        }

        self.release(vm).await
    }

    async fn release(&self, vm: &mut VirtualMachine) -> Result<()> {
        if finalizer::has(&vm.metadata.finalizers, FINALIZER) {
            info!(vmid = vm.spec.vmid, "Removing finalizer");
            vm.metadata.finalizers = finalizer::remove(&vm.metadata.finalizers, FINALIZER);
        } else if !(vm.metadata.deletion_requested() && vm.metadata.finalizers.is_empty()) {
            return Ok(());
        }
        // A write with deletion requested and no finalizers left removes the record.
        self.persist(vm)
            .await
            .map_err(ReconcileError::RemoveFinalizer)
    }

    async fn disconnect(&self) -> Result<()> {
        // Sessions are not torn down; tickets expire on the Proxmox side.
        Ok(())
    }
}
