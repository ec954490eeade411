//! Initial schema: the vms table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Vms::Table)
                    .if_not_exists()
                    .col(pk_auto(Vms::Id))
                    .col(string_len(Vms::Name, 100).not_null().unique_key())
                    .col(string_len(Vms::KeyName, 100).not_null())
                    .col(integer(Vms::Ram).not_null())
                    .col(integer(Vms::Cpu).not_null())
                    .col(string(Vms::Image).not_null())
                    .col(string_len(Vms::PrivateIp, 50).not_null().unique_key())
                    .col(json(Vms::InboundRules).not_null())
                    .col(string_len(Vms::Status, 32).not_null())
                    .col(string_len(Vms::OwnerId, 36).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_vms_name")
                    .table(Vms::Table)
                    .col(Vms::Name)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_vms_owner_id")
                    .table(Vms::Table)
                    .col(Vms::OwnerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Vms::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Vms {
    Table,
    Id,
    Name,
    KeyName,
    Ram,
    Cpu,
    Image,
    PrivateIp,
    InboundRules,
    Status,
    OwnerId,
}
