//! Opens, recycles and closes [`SqlExecutor`]s for the connection pool

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rusqlite::{Connection, OpenFlags};
use tiered_object_pool::{BoxError, FactoryGauge, ObjectFactory, Tier};
use tracing::{debug, warn};

use crate::config::DatabaseConfiguration;
use crate::executor::{RetryPolicy, SqlExecutor};

/// Connection factory for one database file.
///
/// The primary connection switches the database to WAL mode when configured.
/// Secondary connections are opened with `query_only` so that only the primary
/// can write.
pub struct SqlExecutorFactory {
   path: PathBuf,
   configuration: DatabaseConfiguration,
   live: AtomicUsize,
   idle: AtomicUsize,
}

impl SqlExecutorFactory {
   pub fn new(path: impl AsRef<Path>, configuration: DatabaseConfiguration) -> Self {
      Self {
         path: path.as_ref().to_path_buf(),
         configuration,
         live: AtomicUsize::new(0),
         idle: AtomicUsize::new(0),
      }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   fn open(&self, tier: Tier) -> Result<SqlExecutor, BoxError> {
      let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
         | OpenFlags::SQLITE_OPEN_CREATE
         | OpenFlags::SQLITE_OPEN_URI
         | OpenFlags::SQLITE_OPEN_NO_MUTEX;
      let connection = Connection::open_with_flags(&self.path, flags)?;
      connection.busy_timeout(self.configuration.busy_timeout())?;
      connection.set_prepared_statement_cache_capacity(self.configuration.max_sql_cache_size);

      match tier {
         Tier::Primary if self.configuration.journal_mode_wal => {
            let mode: String =
               connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
               warn!(path = %self.path.display(), mode, "Database did not switch to WAL mode");
            }
         }
         Tier::Primary => {}
         Tier::Secondary => connection.pragma_update(None, "query_only", "ON")?,
      }

      self.live.fetch_add(1, Ordering::Relaxed);
      debug!(path = %self.path.display(), ?tier, "Opened connection");
      Ok(SqlExecutor::new(
         connection,
         self.path.to_string_lossy().into_owned(),
         tier,
         self.configuration.max_sql_cache_size,
         RetryPolicy {
            attempts: self.configuration.busy_retry_attempts,
            backoff: self.configuration.busy_retry_backoff(),
         },
      ))
   }
}

impl ObjectFactory<SqlExecutor> for SqlExecutorFactory {
   fn make_object(&self) -> Result<SqlExecutor, BoxError> {
      self.open(Tier::Secondary)
   }

   fn make_primary_object(&self) -> Result<SqlExecutor, BoxError> {
      self.open(Tier::Primary)
   }

   fn activate_object(&self, obj: &mut SqlExecutor) {
      if obj.passive {
         obj.passive = false;
         self.idle.fetch_sub(1, Ordering::Relaxed);
      }
   }

   fn passivate_object(&self, obj: &mut SqlExecutor) {
      if !obj.is_auto_commit() {
         warn!(path = %self.path.display(), "Connection returned mid-transaction, rolling back");
         if let Err(e) = obj.execute("ROLLBACK") {
            debug!(error = %e, "Rollback on return failed");
         }
      }
      if !obj.passive {
         obj.passive = true;
         self.idle.fetch_add(1, Ordering::Relaxed);
      }
   }

   fn destroy_object(&self, obj: SqlExecutor) -> Result<(), BoxError> {
      if obj.passive {
         self.idle.fetch_sub(1, Ordering::Relaxed);
      }
      self.live.fetch_sub(1, Ordering::Relaxed);
      debug!(path = %self.path.display(), "Closing connection");
      obj.into_connection().close().map_err(|(_, e)| Box::new(e) as BoxError)
   }

   fn validate_object(&self, obj: &SqlExecutor) -> bool {
      obj.is_auto_commit()
   }

   fn gauge(&self) -> FactoryGauge {
      let live = self.live.load(Ordering::Relaxed);
      let idle = self.idle.load(Ordering::Relaxed);
      FactoryGauge {
         num_active: live.saturating_sub(idle),
         num_idle: idle,
      }
   }
}
