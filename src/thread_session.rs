//! One [`SqlSession`] per calling thread

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::blob::Blob;
use tracing::{debug, trace};

use crate::executor::SqlExecutor;
use crate::listener::TransactionListener;
use crate::sql_session::{SqlExecutorPool, SqlSession, SqlTransactor, TransactionMode};
use crate::statement::SqlStatementType;
use crate::{Error, Result};

type Registry = Mutex<HashMap<ThreadId, Arc<Mutex<SqlSession>>>>;

thread_local! {
   static ATTACHED: RefCell<Attachments> = RefCell::new(Attachments {
      thread: thread::current().id(),
      registries: Vec::new(),
   });
}

/// Registries holding a session for this thread, detached when it exits.
struct Attachments {
   thread: ThreadId,
   registries: Vec<Weak<Registry>>,
}

impl Attachments {
   fn attach(&mut self, registry: &Arc<Registry>) {
      self.registries.retain(|weak| weak.strong_count() > 0);
      if !self.registries.iter().any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(registry))) {
         self.registries.push(Arc::downgrade(registry));
      }
   }
}

impl Drop for Attachments {
   fn drop(&mut self) {
      for registry in self.registries.drain(..).filter_map(|weak| weak.upgrade()) {
         // Dropped outside the registry lock; a session mid-transaction rolls back here
         let session = registry.lock().remove(&self.thread);
         if session.is_some() {
            debug!("Detaching session of exiting thread");
         }
         drop(session);
      }
   }
}

/// Shares one pool between threads while keeping transaction state per thread.
///
/// Each thread lazily gets its own [`SqlSession`] on first use, torn down
/// when the thread exits. Calls are not reentrant: using the session from
/// inside a block it is already running fails with [`Error::SessionInUse`].
pub struct ThreadScopedSession {
   pool: Arc<SqlExecutorPool>,
   sessions: Arc<Registry>,
}

impl ThreadScopedSession {
   pub fn new(pool: Arc<SqlExecutorPool>) -> Self {
      Self {
         pool,
         sessions: Arc::new(Mutex::new(HashMap::new())),
      }
   }

   pub fn pool(&self) -> &Arc<SqlExecutorPool> {
      &self.pool
   }

   fn with_session<R>(&self, f: impl FnOnce(&mut SqlSession) -> Result<R>) -> Result<R> {
      let mut created = false;
      let session = Arc::clone(
         self
            .sessions
            .lock()
            .entry(thread::current().id())
            .or_insert_with(|| {
               trace!("Creating session for thread");
               created = true;
               Arc::new(Mutex::new(SqlSession::new(Arc::clone(&self.pool))))
            }),
      );
      if created && ATTACHED.try_with(|attached| attached.borrow_mut().attach(&self.sessions)).is_err() {
         debug!("Thread is exiting, session stays until detached");
      }
      let mut guard = session.try_lock().ok_or(Error::SessionInUse)?;
      f(&mut *guard)
   }

   /// Reads the calling thread's session; `default` when it has none.
   fn peek<R>(&self, f: impl FnOnce(&SqlSession) -> R, default: R) -> Result<R> {
      let session = self.sessions.lock().get(&thread::current().id()).cloned();
      match session {
         Some(session) => {
            let guard = session.try_lock().ok_or(Error::SessionInUse)?;
            Ok(f(&*guard))
         }
         None => Ok(default),
      }
   }

   /// Whether the calling thread's session holds a connection.
   ///
   /// Fails with [`Error::SessionInUse`] from inside a running block.
   pub fn has_object(&self) -> Result<bool> {
      self.peek(SqlSession::has_object, false)
   }

   /// Whether the calling thread has a transaction open.
   ///
   /// Fails with [`Error::SessionInUse`] from inside a running block.
   pub fn in_transaction(&self) -> Result<bool> {
      self.peek(SqlSession::in_transaction, false)
   }

   pub fn begin_exclusive_transaction(&self) -> Result<()> {
      self.with_session(|session| session.begin_exclusive_transaction())
   }

   pub fn begin_exclusive_transaction_with_listener(
      &self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.with_session(|session| session.begin_exclusive_transaction_with_listener(listener))
   }

   pub fn begin_immediate_transaction(&self) -> Result<()> {
      self.with_session(|session| session.begin_immediate_transaction())
   }

   pub fn begin_immediate_transaction_with_listener(
      &self,
      listener: Arc<dyn TransactionListener>,
   ) -> Result<()> {
      self.with_session(|session| session.begin_immediate_transaction_with_listener(listener))
   }

   pub fn begin_transaction(
      &self,
      mode: TransactionMode,
      listener: Option<Arc<dyn TransactionListener>>,
   ) -> Result<()> {
      self.with_session(|session| session.begin_transaction(mode, listener))
   }

   pub fn begin_raw_transaction(&self, sql: &str) -> Result<()> {
      self.with_session(|session| session.begin_raw_transaction(sql))
   }

   pub fn end_transaction(&self) -> Result<()> {
      self.with_session(|session| session.end_transaction())
   }

   pub fn set_transaction_successful(&self) -> Result<()> {
      self.with_session(|session| session.set_transaction_successful())
   }

   pub fn yield_transaction(&self) -> Result<bool> {
      self.with_session(|session| session.yield_transaction())
   }

   pub fn yield_transaction_for(&self, pause: Duration) -> Result<bool> {
      self.with_session(|session| session.yield_transaction_for(pause))
   }

   /// Runs `block` on a connection for `sql`: the primary unless `read_only`.
   pub fn execute<R>(
      &self,
      read_only: bool,
      sql: &str,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      self.with_session(|session| session.execute(!read_only, sql, block))
   }

   pub fn with_executor<R>(
      &self,
      primary: bool,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      self.with_session(|session| session.with_executor(primary, block))
   }

   pub fn execute_safely<R>(
      &self,
      primary: bool,
      sql: &str,
      statement_type: SqlStatementType,
      signal: R,
      block: impl FnOnce(&mut SqlExecutor) -> Result<R>,
   ) -> Result<R> {
      self.with_session(|session| session.execute_safely(primary, sql, statement_type, signal, block))
   }

   pub fn blob<R>(
      &self,
      name: &str,
      table: &str,
      column: &str,
      row: i64,
      read_only: bool,
      block: impl FnOnce(&mut Blob<'_>) -> Result<R>,
   ) -> Result<R> {
      self.with_session(|session| session.blob(name, table, column, row, read_only, block))
   }

   /// Forgets the calling thread's session before the thread exits.
   pub fn detach_current_thread(&self) -> Result<()> {
      let mut sessions = self.sessions.lock();
      let id = thread::current().id();
      if let Some(session) = sessions.get(&id) {
         let guard = session.try_lock().ok_or(Error::SessionInUse)?;
         if guard.has_object() {
            return Err(Error::SessionHoldsConnection);
         }
      }
      sessions.remove(&id);
      Ok(())
   }

   /// Number of threads with a live session.
   pub fn active_sessions(&self) -> usize {
      self.sessions.lock().len()
   }
}
