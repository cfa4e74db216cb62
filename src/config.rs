//! Configuration for SQLite databases and their connection pools

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiered_object_pool::PoolConfiguration;

/// Configuration for a [`SqliteDatabase`](crate::SqliteDatabase)
///
/// # Examples
///
/// ```
/// use sqlite_sessions::DatabaseConfiguration;
///
/// // Use defaults
/// let config = DatabaseConfiguration::default();
///
/// // Override just one field
/// let config = DatabaseConfiguration {
///    max_connection_pool_size: 2,
///    ..Default::default()
/// };
/// assert_eq!(config.to_pool_configuration().max_total, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfiguration {
   /// Minimum idle time before a connection may be closed by the eviction sweep
   ///
   /// Default: 20 seconds
   pub eviction_delay_millis: u64,

   /// Period of the eviction sweep; zero disables it
   ///
   /// Default: 60 seconds
   pub time_between_eviction_runs_millis: u64,

   /// Maximum number of open connections, including the primary (writer)
   ///
   /// A value of 1 makes every session share the single primary connection.
   ///
   /// Default: 4
   pub max_connection_pool_size: usize,

   /// Prepared statement cache capacity per connection
   ///
   /// Default: 20
   pub max_sql_cache_size: usize,

   /// How long SQLite's own busy handler waits on a locked database
   ///
   /// Default: 2.5 seconds
   pub busy_timeout_millis: u64,

   /// Attempts made by `execute_with_retry` before giving up on a busy database
   ///
   /// Default: 3
   pub busy_retry_attempts: u32,

   /// First pause between busy retries; doubles after each attempt
   ///
   /// Default: 10 milliseconds
   pub busy_retry_backoff_millis: u64,

   /// Put the database in WAL mode when the primary connection opens
   ///
   /// Default: true
   pub journal_mode_wal: bool,

   /// How long a session waits for a pooled connection; `None` waits forever
   ///
   /// Default: 30 seconds
   pub borrow_timeout_millis: Option<u64>,
}

impl Default for DatabaseConfiguration {
   fn default() -> Self {
      Self {
         eviction_delay_millis: 20_000,
         time_between_eviction_runs_millis: 60_000,
         max_connection_pool_size: 4,
         max_sql_cache_size: 20,
         busy_timeout_millis: 2_500,
         busy_retry_attempts: 3,
         busy_retry_backoff_millis: 10,
         journal_mode_wal: true,
         borrow_timeout_millis: Some(30_000),
      }
   }
}

impl DatabaseConfiguration {
   /// One connection shared by every session.
   pub fn single_writer() -> Self {
      Self {
         max_connection_pool_size: 1,
         ..Default::default()
      }
   }

   pub fn busy_timeout(&self) -> Duration {
      Duration::from_millis(self.busy_timeout_millis)
   }

   pub fn busy_retry_backoff(&self) -> Duration {
      Duration::from_millis(self.busy_retry_backoff_millis)
   }

   pub fn to_pool_configuration(&self) -> PoolConfiguration {
      PoolConfiguration {
         eviction_delay_millis: self.eviction_delay_millis,
         eviction_interval_millis: self.time_between_eviction_runs_millis,
         max_total: self.max_connection_pool_size,
         min_idle: 0,
         borrow_timeout_millis: self.borrow_timeout_millis,
      }
   }
}
