use sea_orm_migration::prelude::*;

use crate::config::DEFAULT_TABLE_NAME;
use crate::schema::{create_table_statement, drop_table_statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(create_table_statement(DEFAULT_TABLE_NAME))
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(drop_table_statement(DEFAULT_TABLE_NAME))
            .await
    }
}
