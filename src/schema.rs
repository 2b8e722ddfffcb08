//! Table bootstrap for the session store.

use sea_orm::sea_query::{Alias, ColumnDef, Table, TableCreateStatement, TableDropStatement};

use crate::entity::session::Column;

/// `CREATE TABLE IF NOT EXISTS` for a session table named `table`.
pub fn create_table_statement(table: &str) -> TableCreateStatement {
    Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(Column::Sid)
                .string_len(128)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(Column::Session).text().not_null())
        .col(ColumnDef::new(Column::Expires).big_unsigned().null())
        .to_owned()
}

/// `DROP TABLE IF EXISTS` for a session table named `table`.
pub fn drop_table_statement(table: &str) -> TableDropStatement {
    Table::drop().table(Alias::new(table)).if_exists().to_owned()
}
