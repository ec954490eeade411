//! Allocation coordinator
//!
//! Orchestrates the record store, the resource pools, the tunnel config
//! reconciler, and the firewall gateway under one mutual-exclusion domain.
//! Every operation that allocates from a finite pool or writes the record
//! set or the config file runs inside the resource lock, in a fixed order:
//! allocation, persistence, config mutation, firewall mutation. The lock is
//! released only after all steps complete or a failure is raised, so no
//! other request observes a half-allocated resource.
//!
//! Tunnel reloads are scheduled after the lock is released; a reload only
//! re-reads the file, so racing the next lock-holder's edits is harmless.
//! The used-IP and used-port sets are derived from the store on every
//! allocation, never cached.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use vmrelay_db::entities::virtual_machine::{InboundRule, Model as VmRecord, RuleProtocol, VmStatus};
use vmrelay_db::{NewVm, VmStore};

use crate::config::ControllerConfig;
use crate::error::CoordinatorError;
use crate::firewall::FirewallGateway;
use crate::pool::{ip_pool, port_pool, Pool};
use crate::provisioner::{render_vagrantfile, Provisioner, VmDefinition};
use crate::reconciler::{ConfigReconciler, ProxyEntry};
use crate::supervisor::TunnelControl;
use crate::tasks::BackgroundRunner;

/// One requested inbound rule, before a remote port is assigned
#[derive(Debug, Clone)]
pub struct RuleRequest {
    pub protocol: RuleProtocol,
    pub vm_port: u16,
    pub description: String,
}

impl RuleRequest {
    /// The default rule every VM gets when none are requested.
    pub fn ssh() -> Self {
        Self {
            protocol: RuleProtocol::Tcp,
            vm_port: 22,
            description: "SSH access".to_string(),
        }
    }
}

/// Request to create a new VM
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub name: String,
    pub key_name: String,
    pub ram: i32,
    pub cpu: i32,
    pub image: String,
    pub inbound_rules: Vec<RuleRequest>,
    /// Optional shell script run inside the VM, as the new user, after the
    /// base provisioning
    pub provisioning_script: Option<String>,
}

/// Result of a successful VM creation
#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub record: VmRecord,
    /// Ready-to-paste SSH command over the first rule's tunnel port
    pub ssh_command: String,
}

struct CoordinatorInner {
    config: ControllerConfig,
    store: VmStore,
    ip_pool: Pool<String>,
    port_pool: Pool<u16>,
    reconciler: ConfigReconciler,
    firewall: Arc<dyn FirewallGateway>,
    tunnel: Arc<dyn TunnelControl>,
    provisioner: Arc<dyn Provisioner>,
    runner: BackgroundRunner,
    /// One lock over the store, both pools, and the config file. Split it
    /// per-pool only if contention ever becomes an issue; the triad's
    /// consistency depends on it being a single domain today.
    resource_lock: Mutex<()>,
}

/// Serializes allocation, persistence, config, and firewall mutations.
///
/// Cheap to clone; clones share the same lock and state.
#[derive(Clone)]
pub struct AllocationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AllocationCoordinator {
    pub fn new(
        config: ControllerConfig,
        store: VmStore,
        reconciler: ConfigReconciler,
        firewall: Arc<dyn FirewallGateway>,
        tunnel: Arc<dyn TunnelControl>,
        provisioner: Arc<dyn Provisioner>,
        runner: BackgroundRunner,
    ) -> Self {
        let ips = ip_pool(&config.ip_base, config.ip_start, config.ip_end);
        let ports = port_pool(config.port_start, config.port_end);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                store,
                ip_pool: ips,
                port_pool: ports,
                reconciler,
                firewall,
                tunnel,
                provisioner,
                runner,
                resource_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &VmStore {
        &self.inner.store
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.inner.config.vms_dir.join(name)
    }

    /// All VMs owned by the caller.
    pub async fn list_vms(&self, owner_id: &str) -> Result<Vec<VmRecord>, CoordinatorError> {
        Ok(self.inner.store.list_for_owner(owner_id).await?)
    }

    /// Create a VM: allocate a private IP and one tunnel port per rule,
    /// persist the record, reconcile the config file, open the firewall,
    /// then provision in the background.
    pub async fn create_vm(
        &self,
        owner_id: &str,
        mut request: CreateVmRequest,
    ) -> Result<CreatedVm, CoordinatorError> {
        if request.inbound_rules.is_empty() {
            request.inbound_rules.push(RuleRequest::ssh());
        }

        let mut seen_ports = HashSet::new();
        for rule in &request.inbound_rules {
            if !seen_ports.insert(rule.vm_port) {
                return Err(CoordinatorError::Conflict(format!(
                    "duplicate VM port {} in request",
                    rule.vm_port
                )));
            }
        }

        let vm_dir = self.vm_dir(&request.name);
        if vm_dir.exists() {
            return Err(CoordinatorError::Conflict(format!(
                "VM '{}' directory already exists",
                request.name
            )));
        }

        let public_key_path = self
            .inner
            .config
            .ssh_dir
            .join(format!("{}.pub", request.key_name));
        if !public_key_path.exists() {
            return Err(CoordinatorError::NotFound(format!(
                "SSH key '{}' does not exist",
                request.key_name
            )));
        }

        let record = {
            let _guard = self.inner.resource_lock.lock().await;

            if self.inner.store.find_by_name(&request.name).await?.is_some() {
                return Err(CoordinatorError::Conflict(format!(
                    "VM name '{}' is already taken",
                    request.name
                )));
            }

            let used_ips = self.inner.store.used_ips().await?;
            let private_ip = self.inner.ip_pool.allocate(&used_ips, &HashSet::new())?;

            let used_ports = self.inner.store.used_ports().await?;
            let mut reserved = HashSet::new();
            let mut rules = Vec::with_capacity(request.inbound_rules.len());
            let mut entries = Vec::with_capacity(request.inbound_rules.len());
            for rule in &request.inbound_rules {
                let remote_port = self.inner.port_pool.allocate(&used_ports, &reserved)?;
                reserved.insert(remote_port);
                rules.push(InboundRule {
                    protocol: rule.protocol,
                    vm_port: rule.vm_port,
                    description: rule.description.clone(),
                    remote_port,
                });
                entries.push(ProxyEntry {
                    name: ProxyEntry::block_name(&request.name, rule.vm_port),
                    local_ip: private_ip.clone(),
                    local_port: rule.vm_port,
                    remote_port,
                });
            }

            let record = self
                .inner
                .store
                .insert(NewVm {
                    name: request.name.clone(),
                    key_name: request.key_name.clone(),
                    ram: request.ram,
                    cpu: request.cpu,
                    image: request.image.clone(),
                    private_ip: private_ip.clone(),
                    inbound_rules: rules.clone(),
                    owner_id: owner_id.to_string(),
                })
                .await?;

            // The record is brand new, so a failure past this point rolls
            // it back best-effort instead of leaving an orphan
            if let Err(err) = self.apply_new_rules(&request.name, &entries, &rules).await {
                self.rollback_create(&record, &entries).await;
                return Err(err);
            }

            record
        };

        tokio::fs::create_dir_all(&vm_dir).await?;
        let definition = VmDefinition {
            name: record.name.clone(),
            image: record.image.clone(),
            ram: record.ram,
            cpu: record.cpu,
            private_ip: record.private_ip.clone(),
            public_key_path,
            provisioning_script: request.provisioning_script,
        };
        tokio::fs::write(vm_dir.join("Vagrantfile"), render_vagrantfile(&definition)).await?;

        info!(vm = %record.name, ip = %record.private_ip, "VM record created, provisioning");
        self.run_provisioning(record.id, &record.name, ProvisioningAction::Up)
            .await;
        self.schedule_reload().await;

        let first_port = record.inbound_rules.0[0].remote_port;
        let ssh_command = format!(
            "ssh -i {} {}@{} -p {}",
            record.key_name, record.name, self.inner.config.public_host, first_port
        );

        Ok(CreatedVm { record, ssh_command })
    }

    /// Append proxy blocks and open firewall ports for freshly allocated rules.
    async fn apply_new_rules(
        &self,
        vm_name: &str,
        entries: &[ProxyEntry],
        rules: &[InboundRule],
    ) -> Result<(), CoordinatorError> {
        self.inner.reconciler.append_proxies(entries).await?;
        for rule in rules {
            self.inner
                .firewall
                .open_port(
                    rule.remote_port,
                    &format!("Tunnel for {vm_name} port {}", rule.remote_port),
                )
                .await?;
        }
        Ok(())
    }

    /// Best-effort rollback of a just-created record and its proxy blocks.
    /// Failures here are logged, not propagated; the original error wins.
    async fn rollback_create(&self, record: &VmRecord, entries: &[ProxyEntry]) {
        warn!(vm = %record.name, "rolling back failed VM creation");

        let names: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();
        if let Err(err) = self.inner.reconciler.remove_proxies(&names).await {
            error!(%err, vm = %record.name, "rollback: failed to remove proxy blocks");
        }
        if let Err(err) = self.inner.store.delete(record.id).await {
            error!(%err, vm = %record.name, "rollback: failed to delete record");
        }
    }

    /// Add an inbound rule to an owned VM, allocating a fresh tunnel port.
    ///
    /// Re-adding a rule for a VM port that already has one returns the
    /// existing rule unchanged, which makes retries idempotent.
    pub async fn add_rule(
        &self,
        owner_id: &str,
        vm_name: &str,
        request: RuleRequest,
    ) -> Result<InboundRule, CoordinatorError> {
        let rule = {
            let _guard = self.inner.resource_lock.lock().await;

            let vm = self.owned_mutable_vm(vm_name, owner_id).await?;

            if let Some(existing) = vm
                .inbound_rules
                .0
                .iter()
                .find(|rule| rule.vm_port == request.vm_port)
            {
                info!(vm = vm_name, vm_port = request.vm_port, "rule already exists");
                return Ok(existing.clone());
            }

            let used_ports = self.inner.store.used_ports().await?;
            let remote_port = self.inner.port_pool.allocate(&used_ports, &HashSet::new())?;

            let rule = InboundRule {
                protocol: request.protocol,
                vm_port: request.vm_port,
                description: request.description.clone(),
                remote_port,
            };

            let private_ip = vm.private_ip.clone();
            let mut rules = vm.inbound_rules.0.clone();
            rules.push(rule.clone());
            self.inner.store.update_rules(vm, rules).await?;

            // Persisted: config and firewall failures from here on are
            // surfaced but not unwound; retrying the call converges
            self.inner
                .reconciler
                .append_proxies(&[ProxyEntry {
                    name: ProxyEntry::block_name(vm_name, request.vm_port),
                    local_ip: private_ip,
                    local_port: request.vm_port,
                    remote_port,
                }])
                .await?;
            self.inner
                .firewall
                .open_port(remote_port, &request.description)
                .await?;

            rule
        };

        info!(vm = vm_name, vm_port = rule.vm_port, remote_port = rule.remote_port, "rule added");
        self.schedule_reload().await;
        Ok(rule)
    }

    /// Remove the inbound rule with the given public tunnel port.
    pub async fn remove_rule(
        &self,
        owner_id: &str,
        vm_name: &str,
        remote_port: u16,
    ) -> Result<(), CoordinatorError> {
        {
            let _guard = self.inner.resource_lock.lock().await;

            let vm = self.owned_mutable_vm(vm_name, owner_id).await?;

            let mut rules = vm.inbound_rules.0.clone();
            let position = rules
                .iter()
                .position(|rule| rule.remote_port == remote_port)
                .ok_or_else(|| {
                    CoordinatorError::NotFound(format!(
                        "rule with public port {remote_port} not found"
                    ))
                })?;
            let removed = rules.remove(position);

            self.inner.store.update_rules(vm, rules).await?;
            self.inner
                .reconciler
                .remove_proxies(&HashSet::from([ProxyEntry::block_name(
                    vm_name,
                    removed.vm_port,
                )]))
                .await?;
            self.inner.firewall.close_port(remote_port).await?;
        }

        info!(vm = vm_name, remote_port, "rule removed");
        self.schedule_reload().await;
        Ok(())
    }

    /// Mark an owned VM as deleting and schedule the teardown of all its
    /// external side effects; the record itself goes last.
    pub async fn delete_vm(&self, owner_id: &str, vm_name: &str) -> Result<(), CoordinatorError> {
        let vm = {
            let _guard = self.inner.resource_lock.lock().await;
            let vm = self.owned_mutable_vm(vm_name, owner_id).await?;
            self.inner.store.set_status(vm.id, VmStatus::Deleting).await?;
            vm
        };

        info!(vm = vm_name, "VM deletion scheduled");
        let coordinator = self.clone();
        self.inner
            .runner
            .submit(async move {
                if let Err(err) = coordinator.teardown_vm(vm.id).await {
                    error!(%err, vm_id = vm.id, "VM teardown failed");
                }
            })
            .await;
        Ok(())
    }

    /// Background half of deletion: destroy the VM, then under the lock
    /// remove its proxy blocks, close its firewall ports, and delete the
    /// record. A failure leaves the record in `deleting` for a later retry.
    async fn teardown_vm(&self, vm_id: i32) -> Result<(), CoordinatorError> {
        let Some(vm) = self.inner.store.find_by_id(vm_id).await? else {
            warn!(vm_id, "teardown: record already gone");
            return Ok(());
        };

        // The long-running destroy stays outside the lock; it touches no
        // shared pool
        let vm_dir = self.vm_dir(&vm.name);
        if vm_dir.exists() {
            if let Err(err) = self.inner.provisioner.destroy(&vm_dir).await {
                warn!(%err, vm = %vm.name, "provisioning tool destroy failed, continuing teardown");
            }
        }

        {
            let _guard = self.inner.resource_lock.lock().await;

            // Re-read under the lock: the pre-destroy snapshot's rule list
            // may be stale by the time the destroy finishes
            let Some(vm) = self.inner.store.find_by_id(vm_id).await? else {
                warn!(vm_id, "teardown: record gone mid-destroy");
                return Ok(());
            };

            let names: HashSet<String> = vm
                .inbound_rules
                .0
                .iter()
                .map(|rule| ProxyEntry::block_name(&vm.name, rule.vm_port))
                .collect();
            self.inner.reconciler.remove_proxies(&names).await?;

            for rule in &vm.inbound_rules.0 {
                self.inner.firewall.close_port(rule.remote_port).await?;
            }

            self.inner.store.delete(vm.id).await?;
        }

        info!(vm = %vm.name, "VM deleted");
        self.schedule_reload().await;
        Ok(())
    }

    /// Boot an existing, owned VM in the background.
    pub async fn start_vm(&self, owner_id: &str, vm_name: &str) -> Result<(), CoordinatorError> {
        let vm = self.owned_mutable_vm(vm_name, owner_id).await?;
        self.ensure_vm_dir(&vm)?;

        self.inner.store.set_status(vm.id, VmStatus::Starting).await?;
        self.run_provisioning(vm.id, &vm.name, ProvisioningAction::Up)
            .await;
        Ok(())
    }

    /// Halt an owned VM in the background.
    pub async fn stop_vm(&self, owner_id: &str, vm_name: &str) -> Result<(), CoordinatorError> {
        let vm = self.owned_mutable_vm(vm_name, owner_id).await?;
        self.ensure_vm_dir(&vm)?;

        self.inner.store.set_status(vm.id, VmStatus::Stopping).await?;
        self.run_provisioning(vm.id, &vm.name, ProvisioningAction::Halt)
            .await;
        Ok(())
    }

    async fn owned_vm(&self, vm_name: &str, owner_id: &str) -> Result<VmRecord, CoordinatorError> {
        self.inner
            .store
            .find_owned(vm_name, owner_id)
            .await?
            .ok_or_else(|| {
                CoordinatorError::Forbidden("VM not found or you do not own it".to_string())
            })
    }

    /// Like `owned_vm`, but rejects a VM whose teardown is already underway.
    /// `deleting` is terminal; mutating such a VM would race the background
    /// teardown and strand proxy blocks or open ports.
    async fn owned_mutable_vm(
        &self,
        vm_name: &str,
        owner_id: &str,
    ) -> Result<VmRecord, CoordinatorError> {
        let vm = self.owned_vm(vm_name, owner_id).await?;
        if vm.status == VmStatus::Deleting {
            return Err(CoordinatorError::Conflict(format!(
                "VM '{vm_name}' is being deleted"
            )));
        }
        Ok(vm)
    }

    fn ensure_vm_dir(&self, vm: &VmRecord) -> Result<(), CoordinatorError> {
        if !self.vm_dir(&vm.name).exists() {
            return Err(CoordinatorError::NotFound(format!(
                "VM directory for '{}' not found",
                vm.name
            )));
        }
        Ok(())
    }

    /// Run the provisioning tool in the background and record the outcome
    /// as the VM's status. Failures are logged, not surfaced; the
    /// triggering request has already returned by the time they happen.
    async fn run_provisioning(&self, vm_id: i32, vm_name: &str, action: ProvisioningAction) {
        let coordinator = self.clone();
        let vm_dir = self.vm_dir(vm_name);
        let vm_name = vm_name.to_string();
        self.inner
            .runner
            .submit(async move {
                let result = match action {
                    ProvisioningAction::Up => coordinator.inner.provisioner.up(&vm_dir).await,
                    ProvisioningAction::Halt => coordinator.inner.provisioner.halt(&vm_dir).await,
                };
                let status = match result {
                    Ok(()) => action.success_status(),
                    Err(err) => {
                        error!(%err, vm = %vm_name, "provisioning tool failed");
                        VmStatus::Error
                    }
                };
                if let Err(err) = coordinator.inner.store.set_status(vm_id, status).await {
                    error!(%err, vm = %vm_name, "failed to record VM status");
                }
            })
            .await;
    }

    /// Schedule a tunnel reload after a short delay, outside the lock.
    async fn schedule_reload(&self) {
        let coordinator = self.clone();
        let delay = self.inner.config.reload_delay;
        self.inner
            .runner
            .submit(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = coordinator.inner.tunnel.reload().await {
                    warn!(%err, "background tunnel reload failed");
                }
            })
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
enum ProvisioningAction {
    Up,
    Halt,
}

impl ProvisioningAction {
    fn success_status(self) -> VmStatus {
        match self {
            Self::Up => VmStatus::Active,
            Self::Halt => VmStatus::Stopped,
        }
    }
}
