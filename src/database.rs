//! Thread-safe facade over one SQLite database file

use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tiered_object_pool::{FactoryGauge, create_object_pool};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::DatabaseConfiguration;
use crate::executor::SqlExecutor;
use crate::factory::SqlExecutorFactory;
use crate::listener::TransactionListener;
use crate::sql_session::SqlExecutorPool;
use crate::statement::SqlStatementType;
use crate::thread_session::ThreadScopedSession;
use crate::{Error, Result};

/// A pooled SQLite database shared between threads.
///
/// Writes go through the primary connection; reads outside a transaction fan
/// out over the secondary connections. Inside a transaction every call on the
/// same thread runs on the transaction's connection.
///
/// # Examples
///
/// ```no_run
/// use sqlite_sessions::{DatabaseConfiguration, SqliteDatabase};
/// use serde_json::json;
///
/// # fn example(runtime: &tokio::runtime::Handle) -> sqlite_sessions::Result<()> {
/// let db = SqliteDatabase::open("app.db", DatabaseConfiguration::default(), runtime)?;
/// db.execute("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)", vec![])?;
///
/// let id = db.transaction(|executor| {
///    executor.execute_for_last_inserted_row_id("INSERT INTO users (name) VALUES (?)", &[json!("Alice")])
/// })?;
///
/// let user = db.fetch_one("SELECT name FROM users WHERE id = ?", vec![json!(id)])?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteDatabase {
   path: PathBuf,
   session: ThreadScopedSession,
}

impl SqliteDatabase {
   /// Opens a pool on `path` and schedules idle-connection eviction on
   /// `runtime`. Connections are opened lazily.
   pub fn open(
      path: impl AsRef<Path>,
      configuration: DatabaseConfiguration,
      runtime: &Handle,
   ) -> Result<Self> {
      let path = path.as_ref().to_path_buf();
      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         std::fs::create_dir_all(parent)?;
      }
      let pool_configuration = configuration.to_pool_configuration();
      let factory = Arc::new(SqlExecutorFactory::new(&path, configuration));
      let pool: SqlExecutorPool = create_object_pool(factory, runtime, pool_configuration)?;
      debug!(path = %path.display(), "Opened database");
      Ok(Self {
         path,
         session: ThreadScopedSession::new(Arc::new(pool)),
      })
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// The calling thread's session, for lower-level control.
   pub fn session(&self) -> &ThreadScopedSession {
      &self.session
   }

   /// Executes a write statement, returning the number of changed rows.
   pub fn execute(&self, sql: &str, args: Vec<JsonValue>) -> Result<usize> {
      self
         .session
         .execute(false, sql, |executor| executor.execute_for_changed_row_count(sql, &args))
   }

   /// Executes an insert, returning the new row id or -1 if nothing was inserted.
   pub fn insert(&self, sql: &str, args: Vec<JsonValue>) -> Result<i64> {
      self
         .session
         .execute(false, sql, |executor| executor.execute_for_last_inserted_row_id(sql, &args))
   }

   /// Executes a SELECT query, possibly returning multiple rows.
   pub fn fetch_all(&self, sql: &str, args: Vec<JsonValue>) -> Result<Vec<IndexMap<String, JsonValue>>> {
      self.session.execute(true, sql, |executor| executor.fetch_all(sql, &args))
   }

   /// Executes a SELECT query expecting zero or one result.
   pub fn fetch_one(
      &self,
      sql: &str,
      args: Vec<JsonValue>,
   ) -> Result<Option<IndexMap<String, JsonValue>>> {
      let mut rows = self.fetch_all(sql, args)?;
      match rows.len() {
         0 | 1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }

   /// First column of the first row as an integer.
   pub fn query_long(&self, sql: &str, args: Vec<JsonValue>) -> Result<i64> {
      self.session.execute(true, sql, |executor| executor.execute_for_long(sql, &args))
   }

   /// First column of the first row as text.
   pub fn query_string(&self, sql: &str, args: Vec<JsonValue>) -> Result<Option<String>> {
      self.session.execute(true, sql, |executor| executor.execute_for_string(sql, &args))
   }

   /// Executes raw SQL, including `BEGIN`, `COMMIT`/`END` and `ROLLBACK`,
   /// which drive the calling thread's transaction state.
   pub fn exec_raw(&self, sql: &str) -> Result<usize> {
      let statement_type = SqlStatementType::of(sql);
      self.session.execute_safely(
         !statement_type.is_read_only(),
         sql,
         statement_type,
         0,
         |executor| executor.execute(sql),
      )
   }

   /// Whether the calling thread has a transaction open.
   ///
   /// Fails with [`Error::SessionInUse`] from inside a running session block.
   pub fn in_transaction(&self) -> Result<bool> {
      self.session.in_transaction()
   }

   pub fn begin_exclusive_transaction(&self) -> Result<()> {
      self.session.begin_exclusive_transaction()
   }

   pub fn begin_exclusive_transaction_with_listener(
      &self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.session.begin_exclusive_transaction_with_listener(listener)
   }

   pub fn begin_immediate_transaction(&self) -> Result<()> {
      self.session.begin_immediate_transaction()
   }

   pub fn begin_immediate_transaction_with_listener(
      &self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.session.begin_immediate_transaction_with_listener(listener)
   }

   pub fn end_transaction(&self) -> Result<()> {
      self.session.end_transaction()
   }

   pub fn set_transaction_successful(&self) -> Result<()> {
      self.session.set_transaction_successful()
   }

   pub fn yield_transaction(&self) -> Result<bool> {
      self.session.yield_transaction()
   }

   pub fn yield_transaction_for(&self, pause: Duration) -> Result<bool> {
      self.session.yield_transaction_for(pause)
   }

   /// Runs `block` in an immediate transaction, committing if it succeeds
   /// and rolling back if it fails.
   ///
   /// Calls nest with transactions already open on this thread. A panic in
   /// `block` ends the level unmarked while unwinding.
   pub fn transaction<R>(&self, block: impl FnOnce(&mut SqlExecutor) -> Result<R>) -> Result<R> {
      self.session.begin_immediate_transaction()?;
      let scope = TransactionScope { session: &self.session };
      let result = self.session.with_executor(true, block);
      let marked = match &result {
         Ok(_) => self.session.set_transaction_successful(),
         Err(_) => Ok(()),
      };
      let ended = scope.end();
      let value = result?;
      marked?;
      ended?;
      Ok(value)
   }

   /// Passive WAL checkpoint on the primary connection.
   pub fn checkpoint(&self) -> Result<()> {
      self.session.with_executor(true, SqlExecutor::checkpoint)
   }

   pub fn gauge(&self) -> FactoryGauge {
      self.session.pool().gauge()
   }

   /// Closes idle connections and fails further borrows. Connections checked
   /// out by other threads are closed when they come back.
   pub fn close(&self) {
      debug!(path = %self.path.display(), "Closing database");
      self.session.pool().close();
   }
}

/// One level begun by [`SqliteDatabase::transaction`], ended when dropped.
struct TransactionScope<'a> {
   session: &'a ThreadScopedSession,
}

impl TransactionScope<'_> {
   fn end(self) -> Result<()> {
      let this = ManuallyDrop::new(self);
      this.session.end_transaction()
   }
}

impl Drop for TransactionScope<'_> {
   fn drop(&mut self) {
      warn!("Ending transaction level after a panic");
      if let Err(e) = self.session.end_transaction() {
         warn!(error = %e, "Ending transaction during unwind failed");
      }
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;

   fn runtime() -> tokio::runtime::Runtime {
      tokio::runtime::Builder::new_multi_thread()
         .worker_threads(1)
         .enable_time()
         .build()
         .unwrap()
   }

   fn create_test_db(runtime: &tokio::runtime::Runtime) -> (SqliteDatabase, TempDir) {
      let temp_dir = TempDir::new().unwrap();
      let db = SqliteDatabase::open(
         temp_dir.path().join("test.db"),
         DatabaseConfiguration::default(),
         runtime.handle(),
      )
      .unwrap();
      db.execute(
         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)",
         vec![],
      )
      .unwrap();
      (db, temp_dir)
   }

   #[test]
   fn test_execute_and_fetch() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);

      let id = db
         .insert("INSERT INTO users (name, age) VALUES (?, ?)", vec![json!("Alice"), json!(30)])
         .unwrap();
      assert_eq!(id, 1);
      db.insert("INSERT INTO users (name, age) VALUES (?, ?)", vec![json!("Bob"), json!(25)])
         .unwrap();

      let changed = db
         .execute("UPDATE users SET age = age + 1 WHERE age > ?", vec![json!(20)])
         .unwrap();
      assert_eq!(changed, 2);

      let rows = db.fetch_all("SELECT name, age FROM users ORDER BY id", vec![]).unwrap();
      assert_eq!(rows.len(), 2);
      assert_eq!(rows[0]["name"], json!("Alice"));
      assert_eq!(rows[0]["age"], json!(31));
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 2);
      assert_eq!(
         db.query_string("SELECT name FROM users WHERE id = ?", vec![json!(2)]).unwrap(),
         Some("Bob".into())
      );
   }

   #[test]
   fn test_fetch_one() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);
      assert_eq!(db.fetch_one("SELECT * FROM users", vec![]).unwrap(), None);

      db.execute("INSERT INTO users (name) VALUES ('Alice'), ('Bob')", vec![]).unwrap();
      let row = db
         .fetch_one("SELECT name FROM users WHERE name = ?", vec![json!("Bob")])
         .unwrap()
         .unwrap();
      assert_eq!(row["name"], json!("Bob"));

      let err = db.fetch_one("SELECT * FROM users", vec![]).unwrap_err();
      assert!(matches!(err, Error::MultipleRowsReturned(2)));
   }

   #[test]
   fn test_transaction_commits_and_rolls_back() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);

      db.transaction(|executor| executor.execute("INSERT INTO users (name) VALUES ('Alice')"))
         .unwrap();
      let err = db
         .transaction(|executor| {
            executor.execute("INSERT INTO users (name) VALUES ('Bob')")?;
            executor.execute("INSERT INTO users (name) VALUES (NULL)")
         })
         .unwrap_err();
      assert!(matches!(err, Error::Sqlite(_)));

      assert!(!db.in_transaction().unwrap());
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 1);
   }

   #[test]
   fn test_panicking_transaction_rolls_back_and_frees_primary() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);

      let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
         let _: Result<usize> = db.transaction(|executor| {
            executor.execute("INSERT INTO users (name) VALUES ('Alice')")?;
            panic!("block failed");
         });
      }));
      assert!(outcome.is_err());
      assert!(!db.in_transaction().unwrap());
      assert!(!db.session().has_object().unwrap());

      std::thread::scope(|scope| {
         scope
            .spawn(|| {
               db.begin_immediate_transaction().unwrap();
               db.end_transaction().unwrap();
            })
            .join()
            .unwrap();
      });
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 0);
   }

   #[test]
   fn test_reads_inside_transaction_see_uncommitted_writes() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);

      db.begin_immediate_transaction().unwrap();
      db.execute("INSERT INTO users (name) VALUES ('Alice')", vec![]).unwrap();
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 1);
      db.end_transaction().unwrap();
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 0);
   }

   #[test]
   fn test_exec_raw_drives_transactions() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);

      db.exec_raw("BEGIN IMMEDIATE").unwrap();
      assert!(db.in_transaction().unwrap());
      assert_eq!(db.exec_raw("INSERT INTO users (name) VALUES ('Alice')").unwrap(), 1);
      db.exec_raw("END").unwrap();
      assert!(!db.in_transaction().unwrap());

      db.exec_raw("BEGIN").unwrap();
      db.exec_raw("DELETE FROM users").unwrap();
      db.exec_raw("ROLLBACK").unwrap();
      assert_eq!(db.query_long("SELECT COUNT(*) FROM users", vec![]).unwrap(), 1);
   }

   #[test]
   fn test_gauge_and_close() {
      let runtime = runtime();
      let (db, _temp_dir) = create_test_db(&runtime);
      db.fetch_all("SELECT * FROM users", vec![]).unwrap();
      assert!(db.gauge().num_idle >= 1);
      assert_eq!(db.gauge().num_active, 0);

      db.close();
      assert_eq!(db.gauge().total(), 0);
      assert!(matches!(db.fetch_all("SELECT 1", vec![]), Err(Error::Pool(_))));
   }
}
