//! VirtualMachine entity: one record per provisioned VM

use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a virtual machine
///
/// Transitions follow provisioning -> {starting <-> active <-> stopping <->
/// stopped} -> deleting -> removed. `Error` is reachable from any state and
/// is terminal for automated retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Initial boot and base provisioning in progress
    #[sea_orm(string_value = "provisioning")]
    Provisioning,

    /// Boot requested for an existing VM
    #[sea_orm(string_value = "starting")]
    Starting,

    /// VM is up and reachable through its tunnel ports
    #[sea_orm(string_value = "active")]
    Active,

    /// Halt requested
    #[sea_orm(string_value = "stopping")]
    Stopping,

    /// VM is halted; record and resources are retained
    #[sea_orm(string_value = "stopped")]
    Stopped,

    /// Teardown of external side effects in progress
    #[sea_orm(string_value = "deleting")]
    Deleting,

    /// A background operation failed; operator intervention required
    #[sea_orm(string_value = "error")]
    Error,
}

/// Protocol kind for an inbound rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Http,
    Ssh,
    Icmp,
}

/// One inbound forwarding rule on a VM
///
/// `vm_port` is unique per VM; `remote_port` is globally unique across every
/// VM's rule list (it is the public end of the tunnel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRule {
    #[serde(rename = "type")]
    pub protocol: RuleProtocol,
    pub vm_port: u16,
    #[serde(default)]
    pub description: String,
    pub remote_port: u16,
}

/// Ordered list of inbound rules, stored as a JSON column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, Default)]
pub struct InboundRules(pub Vec<InboundRule>);

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vms")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// VM identity, unique across all records
    #[sea_orm(column_type = "String(StringLen::N(100))", unique, indexed)]
    pub name: String,

    /// Name of the SSH keypair injected at provision time
    #[sea_orm(column_type = "String(StringLen::N(100))")]
    pub key_name: String,

    /// Memory in MB
    pub ram: i32,

    /// CPU count
    pub cpu: i32,

    /// Base box identifier
    pub image: String,

    /// Private network address, unique across all records
    #[sea_orm(column_type = "String(StringLen::N(50))", unique)]
    pub private_ip: String,

    /// Ordered list of inbound rules
    #[sea_orm(column_type = "Json")]
    pub inbound_rules: InboundRules,

    /// Lifecycle status
    pub status: VmStatus,

    /// Authenticated owner identity (opaque UUID string)
    #[sea_orm(column_type = "String(StringLen::N(36))", indexed)]
    pub owner_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
