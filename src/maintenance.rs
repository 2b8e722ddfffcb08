//! Background upkeep: keepalive pings and the expiry sweep.
//!
//! Both tasks submit ordinary operations to the store's [`Executor`], so they
//! get the same retry and release behaviour as request-driven calls and never
//! block them.

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MaintenanceOptions;
use crate::error::{Error, Result};
use crate::executor::{Executor, Operation};
use crate::store::SqlSessionStore;

/// MySQL caps identifiers at 64 characters.
const MAX_EVENT_TABLE_PREFIX: usize = 58;

/// How expired rows are being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Cleanup was not requested.
    Disabled,
    /// A scheduled event inside the database deletes expired rows.
    Event,
    /// An application timer calls [`SqlSessionStore::sweep`].
    Timer,
}

/// Handles to the running maintenance tasks.
///
/// The tasks live as long as this handle: dropping it aborts the keepalive
/// and sweep timers, so keep it alongside the store. A database event, once
/// installed, is not affected.
#[derive(Debug)]
pub struct Maintenance {
    sweep_mode: SweepMode,
    keepalive: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Maintenance {
    /// How expired rows are being removed.
    pub fn sweep_mode(&self) -> SweepMode {
        self.sweep_mode
    }

    /// Whether the keepalive task was started and is still running.
    pub fn keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops both timers. Same as dropping the handle.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        for task in [self.keepalive.take(), self.sweeper.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl SqlSessionStore {
    /// Starts keepalive pings and sets up the expiry sweep.
    ///
    /// Keepalive only runs for pooled connection sources. The sweep prefers a
    /// database event; when the backend has no events or the account lacks the
    /// privilege to create one, a timer with the longer fallback interval is
    /// used instead.
    pub async fn start_maintenance(&self, options: &MaintenanceOptions) -> Result<Maintenance> {
        let keepalive = match options.keepalive {
            Some(period) if self.executor().source().is_pooled() => {
                Some(spawn_keepalive(self.executor().clone(), period))
            }
            _ => None,
        };

        let (sweep_mode, sweeper) = if !options.cleanup {
            (SweepMode::Disabled, None)
        } else if self.install_sweep_event(options.event_interval).await? {
            (SweepMode::Event, None)
        } else {
            let sweeper = spawn_sweeper(self.clone(), options.fallback_sweep_interval);
            (SweepMode::Timer, Some(sweeper))
        };

        tracing::info!(
            table = %self.table_name(),
            ?sweep_mode,
            keepalive = keepalive.is_some(),
            "session store maintenance started"
        );
        Ok(Maintenance {
            sweep_mode,
            keepalive,
            sweeper,
        })
    }

    /// Creates the MySQL event deleting expired rows every `every`.
    ///
    /// Returns `Ok(false)` when the backend is not MySQL or the privilege to
    /// create events is denied.
    pub async fn install_sweep_event(&self, every: Duration) -> Result<bool> {
        let table = self.checked_table_name()?;
        let op = CreateSweepEvent {
            sql: sweep_event_sql(table, every),
        };
        match self.executor().run(&op).await {
            Ok(created) => Ok(created),
            Err(Error::Query(err)) if is_privilege_denied(&err) => {
                tracing::warn!(error = %err, "cannot create sweep event, falling back to a timer");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn spawn_keepalive(executor: Executor, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = executor.ping().await {
                tracing::warn!(error = %err, "keepalive ping failed");
            }
        }
    })
}

fn spawn_sweeper(store: SqlSessionStore, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = store.sweep().await {
                tracing::warn!(error = %err, "expired session sweep failed");
            }
        }
    })
}

fn sweep_event_sql(table: &str, every: Duration) -> String {
    let prefix = &table[..table.len().min(MAX_EVENT_TABLE_PREFIX)];
    format!(
        "CREATE EVENT IF NOT EXISTS `{prefix}_sweep` ON SCHEDULE EVERY {} SECOND \
         DO DELETE FROM `{table}` WHERE `expires` > 0 AND `expires` < UNIX_TIMESTAMP()",
        every.as_secs().max(1)
    )
}

fn is_privilege_denied(err: &DbErr) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("access denied") || message.contains("command denied")
}

struct CreateSweepEvent {
    sql: String,
}

#[async_trait]
impl Operation for CreateSweepEvent {
    type Output = bool;

    async fn execute(&self, db: &DatabaseConnection) -> std::result::Result<bool, DbErr> {
        if db.get_database_backend() != DatabaseBackend::MySql {
            return Ok(false);
        }
        db.execute_unprepared(&self.sql).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use sea_orm::{ConnectOptions, MockDatabase, MockExecResult, RuntimeErr};

    use crate::connection::{Connection, ConnectionSource, StandaloneSource};

    /// Lends one shared mock connection as a pool and counts checkouts.
    #[derive(Debug)]
    struct CountingPool {
        db: Arc<DatabaseConnection>,
        acquired: AtomicU32,
    }

    impl CountingPool {
        fn new(backend: DatabaseBackend) -> Arc<Self> {
            Arc::new(Self {
                db: Arc::new(MockDatabase::new(backend).into_connection()),
                acquired: AtomicU32::new(0),
            })
        }

        fn acquired(&self) -> u32 {
            self.acquired.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionSource for CountingPool {
        async fn acquire(&self) -> std::result::Result<Connection, DbErr> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::pooled(self.db.clone()))
        }

        fn is_pooled(&self) -> bool {
            true
        }
    }

    fn no_keepalive(cleanup: bool) -> MaintenanceOptions {
        MaintenanceOptions {
            keepalive: None,
            cleanup,
            ..Default::default()
        }
    }

    #[test]
    fn test_sweep_event_sql() {
        let sql = sweep_event_sql("sessions", Duration::from_secs(60));
        assert_eq!(
            sql,
            "CREATE EVENT IF NOT EXISTS `sessions_sweep` ON SCHEDULE EVERY 60 SECOND \
             DO DELETE FROM `sessions` WHERE `expires` > 0 AND `expires` < UNIX_TIMESTAMP()"
        );
        let long = "t".repeat(64);
        assert!(sweep_event_sql(&long, Duration::ZERO).contains(&format!("`{}_sweep`", "t".repeat(58))));
    }

    #[tokio::test]
    async fn test_mysql_installs_event() {
        let db = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let store = SqlSessionStore::new(db);

        let maintenance = store.start_maintenance(&no_keepalive(true)).await.unwrap();

        assert_eq!(maintenance.sweep_mode(), SweepMode::Event);
        assert!(!maintenance.keepalive_running());
        maintenance.abort();
    }

    #[tokio::test]
    async fn test_denied_event_privilege_falls_back_to_timer() {
        let db = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal(
                "Access denied; you need (at least one of) the EVENT privilege(s) for this operation"
                    .into(),
            ))])
            .into_connection();
        let store = SqlSessionStore::new(db);

        let maintenance = store.start_maintenance(&no_keepalive(true)).await.unwrap();

        assert_eq!(maintenance.sweep_mode(), SweepMode::Timer);
        maintenance.abort();
    }

    #[tokio::test]
    async fn test_other_event_errors_propagate() {
        let db = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal("syntax error".into()))])
            .into_connection();
        let store = SqlSessionStore::new(db);

        let err = store.start_maintenance(&no_keepalive(true)).await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn test_sqlite_uses_timer() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite).into_connection();
        let store = SqlSessionStore::new(db);

        let maintenance = store.start_maintenance(&no_keepalive(true)).await.unwrap();
        assert_eq!(maintenance.sweep_mode(), SweepMode::Timer);
        maintenance.abort();
    }

    #[tokio::test]
    async fn test_keepalive_only_for_pooled_sources() {
        let options = MaintenanceOptions {
            keepalive: Some(Duration::from_secs(3600)),
            cleanup: false,
            ..Default::default()
        };

        let pooled = SqlSessionStore::new(MockDatabase::new(DatabaseBackend::MySql).into_connection());
        let maintenance = pooled.start_maintenance(&options).await.unwrap();
        assert!(maintenance.keepalive_running());
        assert_eq!(maintenance.sweep_mode(), SweepMode::Disabled);
        maintenance.abort();

        let standalone = SqlSessionStore::with_source(Arc::new(StandaloneSource::new(
            ConnectOptions::new("mysql://localhost/app"),
        )));
        let maintenance = standalone.start_maintenance(&options).await.unwrap();
        assert!(!maintenance.keepalive_running());
        maintenance.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_once_per_interval() {
        let pool = CountingPool::new(DatabaseBackend::MySql);
        let store = SqlSessionStore::with_source(pool.clone());
        let options = MaintenanceOptions {
            keepalive: Some(Duration::from_secs(30)),
            cleanup: false,
            ..Default::default()
        };

        let maintenance = store.start_maintenance(&options).await.unwrap();
        assert_eq!(pool.acquired(), 0);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(pool.acquired(), 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.acquired(), 4);

        drop(maintenance);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(pool.acquired(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_sweeper_runs_on_its_interval() {
        let pool = CountingPool::new(DatabaseBackend::Sqlite);
        let store = SqlSessionStore::with_source(pool.clone());
        let options = MaintenanceOptions {
            keepalive: None,
            cleanup: true,
            event_interval: Duration::from_secs(60),
            fallback_sweep_interval: Duration::from_secs(900),
        };

        let maintenance = store.start_maintenance(&options).await.unwrap();
        assert_eq!(maintenance.sweep_mode(), SweepMode::Timer);
        // One checkout for the event attempt, which SQLite declines.
        assert_eq!(pool.acquired(), 1);

        // Sweeps run at 0, 15 and 30 minutes.
        tokio::time::sleep(Duration::from_secs(1801)).await;
        assert_eq!(pool.acquired(), 4);

        maintenance.abort();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(pool.acquired(), 4);
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_rejected_before_ddl() {
        let db = MockDatabase::new(DatabaseBackend::MySql).into_connection();
        let store = SqlSessionStore::new(db).with_table_name("sessions`; DROP TABLE users; --");
        let err = store.install_sweep_event(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
