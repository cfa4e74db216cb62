//! Transactions layered over a connection [`Session`]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rusqlite::blob::Blob;
use tiered_object_pool::TieredObjectPool;
use tracing::{debug, warn};

use crate::executor::SqlExecutor;
use crate::factory::SqlExecutorFactory;
use crate::listener::TransactionListener;
use crate::session::Session;
use crate::statement::SqlStatementType;
use crate::{Error, Result};

/// Connection pool used by SQL sessions.
pub type SqlExecutorPool = TieredObjectPool<SqlExecutor, SqlExecutorFactory>;

/// Transaction locking mode for an outermost begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
   Exclusive,
   Immediate,
}

impl TransactionMode {
   pub fn sql(self) -> &'static str {
      match self {
         TransactionMode::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
         TransactionMode::Immediate => "BEGIN IMMEDIATE TRANSACTION",
      }
   }
}

/// Transaction control shared by sessions and the database facade.
///
/// Transactions nest: only the outermost begin and end touch the database.
/// Every level must be marked successful before it ends or the whole
/// transaction rolls back.
pub trait SqlTransactor {
   fn in_transaction(&self) -> bool;

   fn begin_exclusive_transaction(&mut self) -> Result<()> {
      self.begin_transaction(TransactionMode::Exclusive, None)
   }

   fn begin_exclusive_transaction_with_listener(
      &mut self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.begin_transaction(TransactionMode::Exclusive, Some(listener))
   }

   fn begin_immediate_transaction(&mut self) -> Result<()> {
      self.begin_transaction(TransactionMode::Immediate, None)
   }

   fn begin_immediate_transaction_with_listener(
      &mut self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.begin_transaction(TransactionMode::Immediate, Some(listener))
   }

   fn begin_transaction(
      &mut self,
      mode: TransactionMode,
      listener: Option<Arc<dyn TransactionListener>>,
   ) -> Result<()>;

   fn end_transaction(&mut self) -> Result<()>;

   fn set_transaction_successful(&mut self) -> Result<()>;

   fn yield_transaction(&mut self) -> Result<bool> {
      self.yield_transaction_for(Duration::ZERO)
   }

   /// Ends the outermost transaction, pauses, then begins again with the same
   /// SQL and listener so that other connections get a chance to write.
   ///
   /// The work so far is committed, unless a nested level has already ended
   /// unsuccessfully: then it is rolled back, the transaction stays doomed to
   /// roll back at its final end, and `false` is returned.
   fn yield_transaction_for(&mut self, pause: Duration) -> Result<bool>;
}

/// A [`Session`] over SQL executors that also tracks transaction nesting.
///
/// While a transaction is open the session holds the primary executor, so
/// every statement run through it (reads included) sees the transaction.
pub struct SqlSession {
   session: Session<SqlExecutor, SqlExecutorFactory>,
   depth: usize,
   /// Whether the innermost open level has been marked successful
   successful: bool,
   /// Set when any level ends without being marked successful
   failed: bool,
   transaction_sql: Option<String>,
   transaction_listener: Option<Arc<dyn TransactionListener>>,
}

impl SqlSession {
   pub fn new(pool: Arc<SqlExecutorPool>) -> Self {
      Self {
         session: Session::new(pool),
         depth: 0,
         successful: false,
         failed: false,
         transaction_sql: None,
         transaction_listener: None,
      }
   }

   pub fn has_object(&self) -> bool {
      self.session.has_object()
   }

   /// Number of open transaction levels.
   pub fn depth(&self) -> usize {
      self.depth
   }

   /// Begins a transaction with caller-supplied SQL, e.g. `BEGIN DEFERRED`.
   pub fn begin_raw_transaction(&mut self, sql: &str) -> Result<()> {
      self.begin(sql, None)
   }

   /// Runs `block` on a primary executor, or on a secondary one preferring a
   /// connection that recently prepared `sql`.
   pub fn execute<R>(
      &mut self,
      primary: bool,
      sql: &str,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      self.session.execute(primary, Some(sql), block)
   }

   /// Runs `block` on whichever executor the pool offers first, or on the
   /// primary when `primary` is set.
   pub fn with_executor<R>(
      &mut self,
      primary: bool,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      self.session.execute(primary, None, block)
   }

   /// Routes raw SQL through the transaction state machine.
   ///
   /// `BEGIN` opens a (possibly nested) transaction, `COMMIT`/`END` marks the
   /// innermost level successful and ends it, `ROLLBACK` ends it unmarked. In
   /// those cases `signal` is returned without running `block`. Anything
   /// else runs `block`.
   pub fn execute_safely<R>(
      &mut self,
      primary: bool,
      sql: &str,
      statement_type: SqlStatementType,
      signal: R,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      match statement_type {
         SqlStatementType::Begin => self.begin_raw_transaction(sql)?,
         SqlStatementType::Commit => {
            self.set_transaction_successful()?;
            self.end_transaction()?;
         }
         SqlStatementType::Abort => self.end_transaction()?,
         _ => return self.execute(primary, sql, block),
      }
      Ok(signal)
   }

   /// Opens incremental I/O on one BLOB cell for the duration of `block`.
   pub fn blob<R>(
      &mut self,
      name: &str,
      table: &str,
      column: &str,
      row: i64,
      read_only: bool,
      block: impl FnOnce(&mut Blob<'_>) -> Result<R>,
   ) -> Result<R> {
      self.session.execute(!read_only, None, |executor| {
         let mut blob = executor.execute_for_blob(name, table, column, row, read_only)?;
         block(&mut blob)
      })
   }

   fn begin(&mut self, sql: &str, listener: Option<Arc<dyn TransactionListener>>) -> Result<()> {
      if self.depth == 0 {
         self.internal_begin(sql, listener)?;
         self.transaction_sql = Some(sql.to_string());
         self.failed = false;
      } else if self.successful {
         return Err(Error::AlreadyMarkedSuccessful);
      }
      self.depth += 1;
      self.successful = false;
      Ok(())
   }

   fn internal_begin(&mut self, sql: &str, listener: Option<Arc<dyn TransactionListener>>) -> Result<()> {
      let executor = self.session.retain(true, None)?;
      let mut result = executor.execute_with_retry(sql).map(drop);
      let began = result.is_ok();
      if began && let Some(listener) = &listener {
         result = listener.on_begin().map_err(Error::Listener);
      }
      if let Err(e) = result {
         rollback_quietly(executor);
         if let Err(release_error) = self.session.release() {
            debug!(error = %release_error, "Release after failed begin failed");
         }
         // Only a listener that was told about the begin hears about the rollback
         if began
            && let Some(listener) = &listener
            && let Err(rollback_error) = listener.on_rollback()
         {
            debug!(error = %rollback_error, "Listener failed on rollback after failed begin");
         }
         return Err(e);
      }
      self.transaction_listener = listener;
      debug!(sql, "Transaction begun");
      Ok(())
   }

   fn internal_end(&mut self, commit: bool) -> Result<()> {
      let result = if commit { self.commit() } else { self.rollback() };
      let released = self.session.release();
      result?;
      released
   }

   fn commit(&mut self) -> Result<()> {
      let listener = self.transaction_listener.clone();
      self.session.execute(true, None, |executor| {
         let committed = match &listener {
            Some(listener) => listener.on_commit().map_err(Error::Listener),
            None => Ok(()),
         }
         .and_then(|()| executor.execute_with_retry("END"));
         if let Err(e) = committed {
            rollback_quietly(executor);
            return Err(e);
         }
         debug!("Transaction committed");
         Ok(())
      })
   }

   fn rollback(&mut self) -> Result<()> {
      let listener = self.transaction_listener.clone();
      self.session.execute(true, None, |executor| {
         let notified = match &listener {
            Some(listener) => listener.on_rollback().map_err(Error::Listener),
            None => Ok(()),
         };
         let rolled_back = executor.execute("ROLLBACK");
         debug!("Transaction rolled back");
         notified.and(rolled_back.map(drop))
      })
   }

   fn reset(&mut self) {
      self.depth = 0;
      self.successful = false;
      self.failed = false;
      self.transaction_sql = None;
      self.transaction_listener = None;
   }
}

impl SqlTransactor for SqlSession {
   fn in_transaction(&self) -> bool {
      self.depth > 0
   }

   fn begin_transaction(
      &mut self,
      mode: TransactionMode,
      listener: Option<Arc<dyn TransactionListener>>,
   ) -> Result<()> {
      self.begin(mode.sql(), listener)
   }

   fn end_transaction(&mut self) -> Result<()> {
      if self.depth == 0 {
         return Err(Error::TransactionNotBegun);
      }
      if !self.successful {
         self.failed = true;
      }
      self.successful = false;
      self.depth -= 1;
      if self.depth > 0 {
         return Ok(());
      }
      let commit = !self.failed;
      let result = self.internal_end(commit);
      self.reset();
      result
   }

   fn set_transaction_successful(&mut self) -> Result<()> {
      if self.depth == 0 {
         return Err(Error::NotInTransaction);
      }
      if self.successful {
         return Err(Error::AlreadyMarkedSuccessful);
      }
      self.successful = true;
      Ok(())
   }

   fn yield_transaction_for(&mut self, pause: Duration) -> Result<bool> {
      if self.depth == 0 {
         return Err(Error::NotInTransaction);
      }
      let Some(sql) = self.transaction_sql.clone() else {
         return Err(Error::NotInTransaction);
      };
      let listener = self.transaction_listener.clone();
      let commit = !self.failed;

      if let Err(e) = self.internal_end(commit) {
         self.reset();
         return Err(e);
      }
      if !pause.is_zero() {
         thread::sleep(pause);
      }
      if let Err(e) = self.internal_begin(&sql, listener) {
         self.reset();
         return Err(e);
      }
      debug!(depth = self.depth, commit, "Transaction yielded");
      Ok(commit)
   }
}

impl Drop for SqlSession {
   fn drop(&mut self) {
      if self.depth > 0 {
         warn!(depth = self.depth, "Session dropped inside a transaction, rolling back");
         if let Err(e) = self.internal_end(false) {
            warn!(error = %e, "Rollback of dropped session failed");
         }
         self.reset();
      }
   }
}

/// Rolls back, swallowing only the rollback's own error.
fn rollback_quietly(executor: &mut SqlExecutor) {
   if let Err(e) = executor.execute("ROLLBACK") {
      debug!(error = %e, "Quiet rollback failed");
   }
}
