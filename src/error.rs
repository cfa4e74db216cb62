/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

pub use tiered_object_pool::BoxError;

/// Error types for SQLite session operations.
///
/// Variants fall into the classes callers act on differently: usage errors
/// are programming mistakes ([`Error::is_usage`]), contention errors may be
/// retried at a higher level ([`Error::is_contention`]), everything else is a
/// database or construction failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the SQLite driver.
   #[error(transparent)]
   Sqlite(#[from] rusqlite::Error),

   /// Error from the connection pool.
   #[error(transparent)]
   Pool(#[from] tiered_object_pool::Error),

   /// Statement kept failing with SQLITE_BUSY/SQLITE_LOCKED through every retry.
   #[error("database is busy: gave up on `{sql}` after {attempts} attempt(s)")]
   Busy { sql: String, attempts: u32 },

   /// `end_transaction` with no transaction open.
   #[error("transaction not begun")]
   TransactionNotBegun,

   /// Operation requires an open transaction.
   #[error("this thread is not in a transaction")]
   NotInTransaction,

   /// The innermost transaction level is already marked successful.
   #[error("this thread's current transaction is already marked as successful")]
   AlreadyMarkedSuccessful,

   /// Session released a connection more times than it retained one.
   #[error("session released a connection it does not hold")]
   ReleaseWithoutRetain,

   /// The calling thread's session is already borrowed further up the stack.
   #[error("this thread's session is already in use")]
   SessionInUse,

   /// Detaching a session that still holds a connection.
   #[error("this thread's session still holds a connection")]
   SessionHoldsConnection,

   /// A transaction listener callback failed.
   #[error("transaction listener failed: {0}")]
   Listener(#[source] BoxError),

   /// SQLite value that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from a single-row query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
            format!("SQLITE_{}", e.extended_code)
         }
         Error::Sqlite(_) => "SQLITE_ERROR".to_string(),
         Error::Pool(tiered_object_pool::Error::Exhausted { .. }) => "POOL_EXHAUSTED".to_string(),
         Error::Pool(tiered_object_pool::Error::Closed) => "POOL_CLOSED".to_string(),
         Error::Pool(_) => "CONNECTION_ERROR".to_string(),
         Error::Busy { .. } => "DATABASE_BUSY".to_string(),
         Error::TransactionNotBegun => "TRANSACTION_NOT_BEGUN".to_string(),
         Error::NotInTransaction => "NOT_IN_TRANSACTION".to_string(),
         Error::AlreadyMarkedSuccessful => "ALREADY_MARKED_SUCCESSFUL".to_string(),
         Error::ReleaseWithoutRetain => "RELEASE_WITHOUT_RETAIN".to_string(),
         Error::SessionInUse => "SESSION_IN_USE".to_string(),
         Error::SessionHoldsConnection => "SESSION_HOLDS_CONNECTION".to_string(),
         Error::Listener(_) => "LISTENER_ERROR".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
      }
   }

   /// Programming mistakes: reported immediately and never worth retrying.
   pub fn is_usage(&self) -> bool {
      matches!(
         self,
         Error::TransactionNotBegun
            | Error::NotInTransaction
            | Error::AlreadyMarkedSuccessful
            | Error::ReleaseWithoutRetain
            | Error::SessionInUse
            | Error::SessionHoldsConnection
      )
   }

   /// Borrow timeouts and engine-level lock conflicts.
   pub fn is_contention(&self) -> bool {
      match self {
         Error::Busy { .. } => true,
         Error::Pool(e) => e.is_contention(),
         Error::Sqlite(e) => is_busy(e),
         _ => false,
      }
   }
}

/// True when SQLite reports the database as busy or locked by another connection.
pub(crate) fn is_busy(error: &rusqlite::Error) -> bool {
   matches!(
      error.sqlite_error_code(),
      Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
   )
}
