//! A pooled SQLite connection

use std::thread;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use rusqlite::blob::Blob;
use rusqlite::{Connection, DatabaseName, OptionalExtension, params_from_iter};
use serde_json::Value as JsonValue;
use tiered_object_pool::{PooledObject, Tier};
use tracing::{debug, trace};

use crate::decode;
use crate::error::is_busy;
use crate::{Error, Result};

const MAX_BUSY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
   pub attempts: u32,
   pub backoff: Duration,
}

/// One SQLite connection plus the bookkeeping the pool needs.
///
/// The executor remembers the SQL it most recently prepared (up to the
/// statement cache size); keyed borrows use that to route a statement back
/// to a connection that already has it cached.
#[derive(Debug)]
pub struct SqlExecutor {
   connection: Connection,
   path: String,
   tier: Tier,
   tag: bool,
   pub(crate) passive: bool,
   recent_sql: IndexSet<String>,
   max_recent_sql: usize,
   retry: RetryPolicy,
}

impl SqlExecutor {
   pub(crate) fn new(
      connection: Connection,
      path: String,
      tier: Tier,
      max_recent_sql: usize,
      retry: RetryPolicy,
   ) -> Self {
      Self {
         connection,
         path,
         tier,
         tag: false,
         passive: false,
         recent_sql: IndexSet::with_capacity(max_recent_sql),
         max_recent_sql,
         retry,
      }
   }

   /// Path of the database this executor is connected to.
   pub fn path(&self) -> &str {
      &self.path
   }

   pub fn is_auto_commit(&self) -> bool {
      self.connection.is_autocommit()
   }

   /// Runs a single statement without arguments, discarding any rows it
   /// returns, and reports how many rows it changed.
   pub fn execute(&mut self, sql: &str) -> Result<usize> {
      self.execute_for_changed_row_count(sql, &[])
   }

   /// [`execute`](Self::execute), retrying with a doubling pause while the
   /// database is busy or locked.
   pub fn execute_with_retry(&mut self, sql: &str) -> Result<usize> {
      let attempts = self.retry.attempts.max(1);
      let mut backoff = self.retry.backoff;
      for attempt in 1..=attempts {
         match self.execute(sql) {
            Err(Error::Sqlite(e)) if is_busy(&e) => {
               debug!(sql, attempt, attempts, "Database busy");
               if attempt < attempts {
                  thread::sleep(backoff);
                  backoff = (backoff * 2).min(MAX_BUSY_BACKOFF);
               }
            }
            result => return result,
         }
      }
      Err(Error::Busy {
         sql: sql.to_string(),
         attempts,
      })
   }

   pub fn execute_for_changed_row_count(&mut self, sql: &str, args: &[JsonValue]) -> Result<usize> {
      self.remember(sql);
      let mut stmt = self.connection.prepare_cached(sql)?;
      let params = params_from_iter(args.iter().map(decode::to_sql));
      if stmt.column_count() == 0 {
         return Ok(stmt.execute(params)?);
      }
      let mut rows = stmt.query(params)?;
      while rows.next()?.is_some() {}
      Ok(0)
   }

   /// Runs an insert and returns the new row id, or -1 if nothing was inserted.
   pub fn execute_for_last_inserted_row_id(&mut self, sql: &str, args: &[JsonValue]) -> Result<i64> {
      let changed = self.execute_for_changed_row_count(sql, args)?;
      Ok(if changed > 0 {
         self.connection.last_insert_rowid()
      } else {
         -1
      })
   }

   /// First column of the first row as an integer.
   pub fn execute_for_long(&mut self, sql: &str, args: &[JsonValue]) -> Result<i64> {
      self.remember(sql);
      let mut stmt = self.connection.prepare_cached(sql)?;
      let value = stmt.query_row(params_from_iter(args.iter().map(decode::to_sql)), |row| {
         row.get(0)
      })?;
      Ok(value)
   }

   /// First column of the first row as text; `None` when there is no row or
   /// the value is NULL.
   pub fn execute_for_string(&mut self, sql: &str, args: &[JsonValue]) -> Result<Option<String>> {
      self.remember(sql);
      let mut stmt = self.connection.prepare_cached(sql)?;
      let value = stmt
         .query_row(params_from_iter(args.iter().map(decode::to_sql)), |row| {
            row.get::<_, Option<String>>(0)
         })
         .optional()?;
      Ok(value.flatten())
   }

   /// Every row of a query, each as an ordered column name to JSON map.
   pub fn fetch_all(
      &mut self,
      sql: &str,
      args: &[JsonValue],
   ) -> Result<Vec<IndexMap<String, JsonValue>>> {
      self.remember(sql);
      let mut stmt = self.connection.prepare_cached(sql)?;
      let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
      let mut rows = stmt.query(params_from_iter(args.iter().map(decode::to_sql)))?;

      let mut values = Vec::new();
      while let Some(row) = rows.next()? {
         let mut value = IndexMap::with_capacity(columns.len());
         for (i, column) in columns.iter().enumerate() {
            value.insert(column.clone(), decode::to_json(row.get_ref(i)?)?);
         }
         values.push(value);
      }
      Ok(values)
   }

   /// Opens incremental I/O on one BLOB cell.
   ///
   /// `name` is the schema name: `main`, `temp` or an attached database.
   pub fn execute_for_blob(
      &mut self,
      name: &str,
      table: &str,
      column: &str,
      row: i64,
      read_only: bool,
   ) -> Result<Blob<'_>> {
      let database = match name {
         "main" => DatabaseName::Main,
         "temp" => DatabaseName::Temp,
         attached => DatabaseName::Attached(attached),
      };
      Ok(self.connection.blob_open(database, table, column, row, read_only)?)
   }

   /// Passive WAL checkpoint; a no-op outside WAL mode.
   pub fn checkpoint(&mut self) -> Result<()> {
      let (busy, log, checkpointed): (i64, i64, i64) =
         self.connection.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
         })?;
      trace!(path = %self.path, busy, log, checkpointed, "Checkpointed");
      Ok(())
   }

   pub(crate) fn into_connection(self) -> Connection {
      self.connection
   }

   fn remember(&mut self, sql: &str) {
      if self.max_recent_sql == 0 {
         return;
      }
      if let Some(index) = self.recent_sql.get_index_of(sql) {
         let last = self.recent_sql.len() - 1;
         self.recent_sql.move_index(index, last);
         return;
      }
      if self.recent_sql.len() == self.max_recent_sql {
         self.recent_sql.shift_remove_index(0);
      }
      self.recent_sql.insert(sql.to_string());
   }
}

impl PooledObject for SqlExecutor {
   type Key = str;

   fn tier(&self) -> Tier {
      self.tier
   }

   fn tag(&self) -> bool {
      self.tag
   }

   fn set_tag(&mut self, tag: bool) {
      self.tag = tag;
   }

   fn matches(&self, key: &str) -> bool {
      self.recent_sql.contains(key)
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;

   use super::*;

   fn executor(max_recent_sql: usize) -> SqlExecutor {
      let connection = Connection::open_in_memory().unwrap();
      SqlExecutor::new(
         connection,
         ":memory:".into(),
         Tier::Primary,
         max_recent_sql,
         RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
         },
      )
   }

   #[test]
   fn test_execute_and_fetch() {
      let mut executor = executor(10);
      executor
         .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, data BLOB)")
         .unwrap();

      let id = executor
         .execute_for_last_inserted_row_id(
            "INSERT INTO users (name) VALUES (?)",
            &[json!("Alice")],
         )
         .unwrap();
      assert_eq!(id, 1);
      executor
         .execute("INSERT INTO users (name, data) VALUES ('Bob', x'48656c6c6f')")
         .unwrap();

      let rows = executor.fetch_all("SELECT id, name, data FROM users ORDER BY id", &[]).unwrap();
      assert_eq!(rows.len(), 2);
      assert_eq!(rows[0]["name"], json!("Alice"));
      assert_eq!(rows[0]["data"], JsonValue::Null);
      assert_eq!(rows[1]["data"], json!("SGVsbG8="));
      let keys: Vec<&String> = rows[0].keys().collect();
      assert_eq!(keys, ["id", "name", "data"]);

      assert_eq!(executor.execute_for_long("SELECT COUNT(*) FROM users", &[]).unwrap(), 2);
      assert_eq!(
         executor
            .execute_for_string("SELECT name FROM users WHERE id = ?", &[json!(2)])
            .unwrap(),
         Some("Bob".to_string())
      );
      assert_eq!(
         executor
            .execute_for_string("SELECT name FROM users WHERE id = ?", &[json!(99)])
            .unwrap(),
         None
      );
   }

   #[test]
   fn test_changed_row_count() {
      let mut executor = executor(10);
      executor.execute("CREATE TABLE t (a INTEGER)").unwrap();
      executor.execute("INSERT INTO t VALUES (1), (2), (3)").unwrap();
      let changed = executor
         .execute_for_changed_row_count("UPDATE t SET a = a + 1 WHERE a > ?", &[json!(1)])
         .unwrap();
      assert_eq!(changed, 2);
      assert_eq!(
         executor
            .execute_for_last_inserted_row_id("INSERT INTO t SELECT a FROM t WHERE a > 100", &[])
            .unwrap(),
         -1
      );
   }

   #[test]
   fn test_execute_discards_rows() {
      let mut executor = executor(10);
      assert_eq!(executor.execute("PRAGMA user_version").unwrap(), 0);
      assert_eq!(executor.execute("SELECT 1").unwrap(), 0);
   }

   #[test]
   fn test_auto_commit_tracks_transactions() {
      let mut executor = executor(10);
      assert!(executor.is_auto_commit());
      executor.execute("BEGIN IMMEDIATE TRANSACTION").unwrap();
      assert!(!executor.is_auto_commit());
      executor.execute("ROLLBACK").unwrap();
      assert!(executor.is_auto_commit());
   }

   #[test]
   fn test_matches_recently_prepared_sql() {
      let mut executor = executor(2);
      executor.execute("SELECT 1").unwrap();
      executor.execute("SELECT 2").unwrap();
      assert!(executor.matches("SELECT 1"));
      assert!(executor.matches("SELECT 2"));

      // Touching "SELECT 1" makes "SELECT 2" the oldest
      executor.execute("SELECT 1").unwrap();
      executor.execute("SELECT 3").unwrap();
      assert!(executor.matches("SELECT 1"));
      assert!(!executor.matches("SELECT 2"));
      assert!(executor.matches("SELECT 3"));
   }

   #[test]
   fn test_no_cache_never_matches() {
      let mut executor = executor(0);
      executor.execute("SELECT 1").unwrap();
      assert!(!executor.matches("SELECT 1"));
   }

   #[test]
   fn test_blob_io() {
      use std::io::{Read, Write};

      let mut executor = executor(10);
      executor.execute("CREATE TABLE files (content BLOB)").unwrap();
      executor.execute("INSERT INTO files VALUES (zeroblob(5))").unwrap();
      {
         let mut blob = executor.execute_for_blob("main", "files", "content", 1, false).unwrap();
         blob.write_all(b"hello").unwrap();
      }
      let mut blob = executor.execute_for_blob("main", "files", "content", 1, true).unwrap();
      let mut content = String::new();
      blob.read_to_string(&mut content).unwrap();
      assert_eq!(content, "hello");
   }

   #[test]
   fn test_constraint_violation_is_not_retried() {
      let mut executor = executor(10);
      executor.execute("CREATE TABLE t (a INTEGER PRIMARY KEY)").unwrap();
      executor.execute("INSERT INTO t VALUES (1)").unwrap();
      let err = executor.execute_with_retry("INSERT INTO t VALUES (1)").unwrap_err();
      assert!(matches!(err, Error::Sqlite(_)));
      assert!(!err.is_contention());
   }

   #[test]
   fn test_checkpoint_outside_wal() {
      let mut executor = executor(10);
      executor.checkpoint().unwrap();
   }
}
