//! Session entity model for Sea-ORM database interaction.
//!
//! This module defines the row layout used for session storage. The entity's
//! own table name is the default (`sessions`); stores configured with another
//! table name reuse its columns against that table.

use sea_orm::entity::prelude::*;

/// Sea-ORM entity model representing a stored session.
///
/// # Database Schema
///
/// | Column  | Type                     | Description                                    |
/// |---------|--------------------------|------------------------------------------------|
/// | sid     | VARCHAR(128) Primary Key | Session ID                                     |
/// | session | TEXT                     | Plain JSON or a sealed envelope                |
/// | expires | BIGINT UNSIGNED NULL     | Expiry in epoch seconds, zero/null = no expiry |
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    /// The session identifier supplied by the middleware.
    #[sea_orm(primary_key, auto_increment = false)]
    pub sid: String,

    /// The serialized session, sealed when the store has a secret.
    #[sea_orm(column_type = "Text")]
    pub session: String,

    /// Expiry as unix seconds. Rows with zero or null never expire.
    pub expires: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Projection used when only the payload is needed.
#[derive(Debug, sea_orm::FromQueryResult)]
pub struct Payload {
    pub session: String,
}
