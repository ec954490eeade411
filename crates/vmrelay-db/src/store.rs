//! Typed query layer over the vms table
//!
//! All mutating methods are expected to run under the coordinator's resource
//! lock; the store itself only guarantees durability and query correctness.

use std::collections::HashSet;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QuerySelect, Set,
};
use thiserror::Error;

use crate::entities::virtual_machine::{self, InboundRule, InboundRules, VmStatus};

/// Errors surfaced by store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// Fields of a VM record to be created
///
/// The new record always starts in `provisioning` status.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub name: String,
    pub key_name: String,
    pub ram: i32,
    pub cpu: i32,
    pub image: String,
    pub private_ip: String,
    pub inbound_rules: Vec<InboundRule>,
    pub owner_id: String,
}

/// Queryable record store for VM records and their inbound rules
#[derive(Clone)]
pub struct VmStore {
    db: DatabaseConnection,
}

impl VmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Fetch a VM by name regardless of owner.
    pub async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<virtual_machine::Model>, StoreError> {
        Ok(virtual_machine::Entity::find()
            .filter(virtual_machine::Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    /// Fetch a VM by primary key.
    pub async fn find_by_id(&self, id: i32) -> Result<Option<virtual_machine::Model>, StoreError> {
        Ok(virtual_machine::Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Fetch a VM by name, only if it belongs to the given owner.
    pub async fn find_owned(
        &self,
        name: &str,
        owner_id: &str,
    ) -> Result<Option<virtual_machine::Model>, StoreError> {
        Ok(virtual_machine::Entity::find()
            .filter(virtual_machine::Column::Name.eq(name))
            .filter(virtual_machine::Column::OwnerId.eq(owner_id))
            .one(&self.db)
            .await?)
    }

    /// All VMs owned by the given owner.
    pub async fn list_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<virtual_machine::Model>, StoreError> {
        Ok(virtual_machine::Entity::find()
            .filter(virtual_machine::Column::OwnerId.eq(owner_id))
            .all(&self.db)
            .await?)
    }

    /// Total number of VM records, across all owners.
    pub async fn count(&self) -> Result<u64, StoreError> {
        Ok(virtual_machine::Entity::find().count(&self.db).await?)
    }

    /// Every private IP currently assigned to a record.
    pub async fn used_ips(&self) -> Result<HashSet<String>, StoreError> {
        let ips: Vec<String> = virtual_machine::Entity::find()
            .select_only()
            .column(virtual_machine::Column::PrivateIp)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(ips.into_iter().collect())
    }

    /// Every remote (public tunnel) port in use, flattened across all rule lists.
    pub async fn used_ports(&self) -> Result<HashSet<u16>, StoreError> {
        let rule_lists: Vec<InboundRules> = virtual_machine::Entity::find()
            .select_only()
            .column(virtual_machine::Column::InboundRules)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(rule_lists
            .into_iter()
            .flat_map(|rules| rules.0.into_iter().map(|rule| rule.remote_port))
            .collect())
    }

    /// Insert a new record in `provisioning` status.
    ///
    /// Name and private IP uniqueness violations surface as
    /// [`StoreError::Conflict`], never a silent retry.
    pub async fn insert(&self, new: NewVm) -> Result<virtual_machine::Model, StoreError> {
        if self.find_by_name(&new.name).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "VM name '{}' is already taken",
                new.name
            )));
        }

        let active = virtual_machine::ActiveModel {
            name: Set(new.name),
            key_name: Set(new.key_name),
            ram: Set(new.ram),
            cpu: Set(new.cpu),
            image: Set(new.image),
            private_ip: Set(new.private_ip),
            inbound_rules: Set(InboundRules(new.inbound_rules)),
            status: Set(VmStatus::Provisioning),
            owner_id: Set(new.owner_id),
            ..Default::default()
        };

        active.insert(&self.db).await.map_err(map_unique_violation)
    }

    /// Replace a VM's rule list.
    pub async fn update_rules(
        &self,
        vm: virtual_machine::Model,
        rules: Vec<InboundRule>,
    ) -> Result<virtual_machine::Model, StoreError> {
        let mut active: virtual_machine::ActiveModel = vm.into();
        active.inbound_rules = Set(InboundRules(rules));
        Ok(active.update(&self.db).await?)
    }

    /// Update a VM's lifecycle status.
    pub async fn set_status(&self, id: i32, status: VmStatus) -> Result<(), StoreError> {
        let vm = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("VM id {id}")))?;
        let mut active: virtual_machine::ActiveModel = vm.into();
        active.status = Set(status);
        active.update(&self.db).await?;
        Ok(())
    }

    /// Delete a record by primary key.
    pub async fn delete(&self, id: i32) -> Result<(), StoreError> {
        virtual_machine::Entity::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

/// Map a SQL unique-constraint violation onto [`StoreError::Conflict`].
///
/// The coordinator pre-checks name and IP uniqueness under its lock, so this
/// is the backstop for writers that bypass it.
fn map_unique_violation(err: sea_orm::DbErr) -> StoreError {
    let message = err.to_string();
    if message.contains("UNIQUE") || message.contains("unique") {
        StoreError::Conflict(message)
    } else {
        StoreError::Db(err)
    }
}
