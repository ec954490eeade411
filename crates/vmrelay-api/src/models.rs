use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vmrelay_db::entities::virtual_machine;

/// Protocol of an inbound rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Http,
    Ssh,
    Icmp,
}

impl From<virtual_machine::RuleProtocol> for RuleProtocol {
    fn from(protocol: virtual_machine::RuleProtocol) -> Self {
        match protocol {
            virtual_machine::RuleProtocol::Tcp => Self::Tcp,
            virtual_machine::RuleProtocol::Udp => Self::Udp,
            virtual_machine::RuleProtocol::Http => Self::Http,
            virtual_machine::RuleProtocol::Ssh => Self::Ssh,
            virtual_machine::RuleProtocol::Icmp => Self::Icmp,
        }
    }
}

impl From<RuleProtocol> for virtual_machine::RuleProtocol {
    fn from(protocol: RuleProtocol) -> Self {
        match protocol {
            RuleProtocol::Tcp => Self::Tcp,
            RuleProtocol::Udp => Self::Udp,
            RuleProtocol::Http => Self::Http,
            RuleProtocol::Ssh => Self::Ssh,
            RuleProtocol::Icmp => Self::Icmp,
        }
    }
}

/// Lifecycle status of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Starting,
    Active,
    Stopping,
    Stopped,
    Deleting,
    Error,
}

impl From<virtual_machine::VmStatus> for VmStatus {
    fn from(status: virtual_machine::VmStatus) -> Self {
        match status {
            virtual_machine::VmStatus::Provisioning => Self::Provisioning,
            virtual_machine::VmStatus::Starting => Self::Starting,
            virtual_machine::VmStatus::Active => Self::Active,
            virtual_machine::VmStatus::Stopping => Self::Stopping,
            virtual_machine::VmStatus::Stopped => Self::Stopped,
            virtual_machine::VmStatus::Deleting => Self::Deleting,
            virtual_machine::VmStatus::Error => Self::Error,
        }
    }
}

/// One inbound forwarding rule, with its allocated public tunnel port
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InboundRule {
    /// Protocol type
    #[serde(rename = "type")]
    pub protocol: RuleProtocol,
    /// Private port on the VM
    pub vm_port: u16,
    /// Human-readable description
    pub description: String,
    /// Allocated public port on the tunnel host
    pub remote_port: u16,
}

impl From<virtual_machine::InboundRule> for InboundRule {
    fn from(rule: virtual_machine::InboundRule) -> Self {
        Self {
            protocol: rule.protocol.into(),
            vm_port: rule.vm_port,
            description: rule.description,
            remote_port: rule.remote_port,
        }
    }
}

/// A provisioned virtual machine
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Vm {
    pub id: i32,
    /// VM name, unique across all owners
    pub name: String,
    /// SSH keypair injected at provision time
    pub key_name: String,
    /// Memory in MB
    pub ram: i32,
    /// CPU count
    pub cpu: i32,
    /// Base box identifier
    pub image: String,
    /// Private network address
    pub private_ip: String,
    /// Inbound rules, in insertion order
    pub inbound_rules: Vec<InboundRule>,
    /// Lifecycle status
    pub status: VmStatus,
}

impl From<virtual_machine::Model> for Vm {
    fn from(record: virtual_machine::Model) -> Self {
        Self {
            id: record.id,
            name: record.name,
            key_name: record.key_name,
            ram: record.ram,
            cpu: record.cpu,
            image: record.image,
            private_ip: record.private_ip,
            inbound_rules: record
                .inbound_rules
                .0
                .into_iter()
                .map(InboundRule::from)
                .collect(),
            status: record.status.into(),
        }
    }
}

/// List of VMs owned by the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VmList {
    pub vms: Vec<Vm>,
    /// Total number of VMs
    pub total: usize,
}

/// One requested inbound rule; the public port is allocated server-side
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuleRequest {
    /// Protocol type
    #[serde(rename = "type")]
    pub protocol: RuleProtocol,
    /// Private port on the VM to expose
    pub vm_port: u16,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl From<RuleRequest> for vmrelay_core::RuleRequest {
    fn from(request: RuleRequest) -> Self {
        Self {
            protocol: request.protocol.into(),
            vm_port: request.vm_port,
            description: request.description,
        }
    }
}

/// Request to create a new VM
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateVmRequest {
    /// VM name, unique across all owners
    pub name: String,
    /// Name of an SSH keypair already present on the host
    pub key_name: String,
    /// Memory in MB
    pub ram: i32,
    /// CPU count
    pub cpu: i32,
    /// Base box identifier
    pub image: String,
    /// Inbound rules; an SSH rule on port 22 is added when empty
    #[serde(default)]
    pub inbound_rules: Vec<RuleRequest>,
    /// Optional shell script run inside the VM, as the new user, after the
    /// base provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_script: Option<String>,
}

/// Response to a successful VM creation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateVmResponse {
    pub vm: Vm,
    /// Ready-to-paste SSH command over the first rule's tunnel port
    pub ssh_command: String,
}

/// Generic acknowledgement for scheduled operations
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Number of VM records, across all owners
    pub vm_count: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
