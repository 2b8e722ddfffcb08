//! Where the executor gets its database connections from.
//!
//! A [`ConnectionSource`] hands out [`Connection`] handles and takes them back.
//! [`PooledSource`] lends out a shared SeaORM pool that it creates on first use;
//! [`StandaloneSource`] opens a dedicated connection per handle and closes it on
//! release. Custom sources (tests, proxies, multi-tenant routing) implement the
//! trait and are injected with [`SqlSessionStore::with_source`](crate::SqlSessionStore::with_source).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tokio::sync::OnceCell;

/// How a [`Connection`] must be given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Borrowed from a pool; releasing returns it.
    Pooled,
    /// Exclusively owned; releasing closes it.
    Standalone,
}

/// A connection checked out for the duration of one attempt.
///
/// Handles are not `Clone`; [`ConnectionSource::release`] takes them by value,
/// so each handle can be released at most once. The SeaORM connection itself
/// is shared through an [`Arc`], since a pool is handed to many attempts.
#[derive(Debug)]
pub struct Connection {
    db: Arc<DatabaseConnection>,
    kind: ConnectionKind,
}

impl Connection {
    /// Wraps a connection borrowed from a pool.
    pub fn pooled(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            kind: ConnectionKind::Pooled,
        }
    }

    /// Wraps a connection owned by this handle.
    pub fn standalone(db: impl Into<Arc<DatabaseConnection>>) -> Self {
        Self {
            db: db.into(),
            kind: ConnectionKind::Standalone,
        }
    }

    /// The underlying SeaORM connection.
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Pooled or standalone.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Gives the handle back: pooled handles are dropped, standalone ones closed.
    ///
    /// A standalone connection that is still shared elsewhere is only dropped.
    pub async fn close(self) -> Result<(), DbErr> {
        match self.kind {
            ConnectionKind::Pooled => Ok(()),
            ConnectionKind::Standalone => match Arc::try_unwrap(self.db) {
                Ok(db) => db.close().await,
                Err(_shared) => Ok(()),
            },
        }
    }
}

/// Yields connections to the executor and takes them back.
#[async_trait]
pub trait ConnectionSource: Debug + Send + Sync {
    /// Checks out a connection for one attempt.
    async fn acquire(&self) -> Result<Connection, DbErr>;

    /// Returns a connection obtained from [`acquire`](Self::acquire).
    async fn release(&self, conn: Connection) -> Result<(), DbErr> {
        conn.close().await
    }

    /// Whether handles are borrowed from a long-lived pool.
    ///
    /// Keepalive pings are only useful against a pool.
    fn is_pooled(&self) -> bool;
}

/// A shared SeaORM pool, connected lazily on first checkout.
#[derive(Debug)]
pub struct PooledSource {
    options: Option<ConnectOptions>,
    pool: OnceCell<Arc<DatabaseConnection>>,
}

impl PooledSource {
    /// A pool that connects with `options` the first time it is used.
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options: Some(options),
            pool: OnceCell::new(),
        }
    }

    /// A source backed by an already-open connection or pool.
    ///
    /// Accepts either an owned [`DatabaseConnection`] or an `Arc` the caller
    /// keeps a handle to.
    pub fn from_connection(conn: impl Into<Arc<DatabaseConnection>>) -> Self {
        Self {
            options: None,
            pool: OnceCell::new_with(Some(conn.into())),
        }
    }

    async fn pool(&self) -> Result<&Arc<DatabaseConnection>, DbErr> {
        self.pool
            .get_or_try_init(|| async {
                let options = self
                    .options
                    .clone()
                    .ok_or_else(|| DbErr::Custom("pooled source has no connect options".into()))?;
                tracing::debug!("creating session store connection pool");
                Database::connect(options).await.map(Arc::new)
            })
            .await
    }
}

#[async_trait]
impl ConnectionSource for PooledSource {
    async fn acquire(&self) -> Result<Connection, DbErr> {
        Ok(Connection::pooled(self.pool().await?.clone()))
    }

    fn is_pooled(&self) -> bool {
        true
    }
}

/// Opens a single dedicated connection per checkout and closes it on release.
#[derive(Debug, Clone)]
pub struct StandaloneSource {
    options: ConnectOptions,
}

impl StandaloneSource {
    /// A source connecting with `options` on every checkout.
    ///
    /// The options are narrowed to a single connection; whatever pool sizing
    /// they carried is overridden.
    pub fn new(mut options: ConnectOptions) -> Self {
        options.max_connections(1).min_connections(0);
        Self { options }
    }
}

#[async_trait]
impl ConnectionSource for StandaloneSource {
    async fn acquire(&self) -> Result<Connection, DbErr> {
        let db = Database::connect(self.options.clone()).await?;
        Ok(Connection::standalone(db))
    }

    fn is_pooled(&self) -> bool {
        false
    }
}
