//! Bounded-retry execution of database operations.
//!
//! [`Executor::run`] checks a connection out of its [`ConnectionSource`], runs
//! one [`Operation`] against it and gives the connection back before returning.
//! Attempts that fail with a connection-loss error are repeated immediately,
//! up to `max_attempts` in total. Any other failure is returned on first
//! occurrence.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr, RuntimeErr};

use crate::config::DEFAULT_RETRIES;
use crate::connection::ConnectionSource;
use crate::error::{Error, Result};

/// A unit of database work run by the [`Executor`].
///
/// `execute` may be invoked once per attempt, so it must be safe to repeat
/// after a connection was lost mid-way.
#[async_trait]
pub trait Operation: Send + Sync {
    type Output: Send;

    async fn execute(&self, db: &DatabaseConnection) -> std::result::Result<Self::Output, DbErr>;
}

/// Attempt bookkeeping for one logical operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
}

impl RetryState {
    /// Fresh state allowing `max_attempts` attempts in total.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    /// Advances to the next attempt; `false` once the bound is exceeded.
    pub fn next_attempt(&mut self) -> bool {
        self.attempt += 1;
        self.attempt <= self.max_attempts
    }

    /// The current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Runs operations with bounded retries and exactly-once connection release.
#[derive(Clone)]
pub struct Executor {
    source: Arc<dyn ConnectionSource>,
    max_attempts: u32,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("source", &self.source)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Executor {
    /// An executor allowing the default of four attempts per operation.
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            max_attempts: DEFAULT_RETRIES + 1,
        }
    }

    /// Sets the total number of attempts per operation (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Total attempts per operation, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The source connections are checked out from.
    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// Runs `op`, retrying transient connection loss.
    pub async fn run<O>(&self, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        let mut retry = RetryState::new(self.max_attempts);
        let mut last_transient = None;

        while retry.next_attempt() {
            match self.attempt(op).await.map_err(classify) {
                Ok(output) => return Ok(output),
                Err(Error::TransientConnection(err)) => {
                    if retry.has_remaining() {
                        tracing::warn!(
                            attempt = retry.attempt(),
                            max_attempts = self.max_attempts,
                            error = %err,
                            "connection lost, retrying"
                        );
                    }
                    last_transient = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let source = last_transient
            .unwrap_or_else(|| DbErr::Custom("operation was never attempted".to_string()));
        tracing::error!(attempts = self.max_attempts, error = %source, "giving up on operation");
        Err(Error::RetriesExhausted {
            attempts: self.max_attempts,
            source,
        })
    }

    /// Issues a no-op round trip, e.g. to keep pooled connections alive.
    pub async fn ping(&self) -> Result<()> {
        self.run(&Ping).await
    }

    async fn attempt<O>(&self, op: &O) -> std::result::Result<O::Output, DbErr>
    where
        O: Operation + ?Sized,
    {
        let conn = self.source.acquire().await?;
        let result = op.execute(conn.db()).await;
        if let Err(err) = self.source.release(conn).await {
            tracing::warn!(error = %err, "failed to release connection");
        }
        result
    }
}

/// Splits database errors into retryable connection loss and everything else.
pub fn classify(err: DbErr) -> Error {
    if is_transient(&err) {
        Error::TransientConnection(err)
    } else {
        Error::Query(err)
    }
}

/// Whether `err` means the connection went away rather than the statement failing.
pub fn is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => true,
        DbErr::Exec(runtime) | DbErr::Query(runtime) => runtime_is_transient(runtime),
        _ => false,
    }
}

#[cfg(any(feature = "mysql", feature = "postgres", feature = "sqlite"))]
fn runtime_is_transient(err: &RuntimeErr) -> bool {
    match err {
        RuntimeErr::SqlxError(err) => sqlx_is_transient(err),
        _ => false,
    }
}

#[cfg(not(any(feature = "mysql", feature = "postgres", feature = "sqlite")))]
fn runtime_is_transient(_err: &RuntimeErr) -> bool {
    false
}

#[cfg(any(feature = "mysql", feature = "postgres", feature = "sqlite"))]
fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // MySQL client errors 2006 and 2013.
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("server has gone away") || message.contains("lost connection")
        }
        _ => false,
    }
}

struct Ping;

#[async_trait]
impl Operation for Ping {
    type Output = ();

    async fn execute(&self, db: &DatabaseConnection) -> std::result::Result<(), DbErr> {
        db.ping().await
    }
}
