//! Database entity models for the session store.
//!
//! The primary entity in this module is the `session` entity, which describes
//! the columns of the table holding session rows.

/// Session row model and column definitions.
pub mod session;
