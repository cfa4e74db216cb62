//! Error types for tiered-object-pool

use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by an [`ObjectFactory`](crate::ObjectFactory)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that may occur when borrowing from a pool
#[derive(Error, Debug)]
pub enum Error {
   /// The factory failed to construct an object. The pool keeps nothing
   /// half-built and does not retry.
   #[error("failed to construct pooled object: {0}")]
   Factory(#[source] BoxError),

   /// No object became available before the borrow timeout elapsed
   #[error("pool exhausted: no object became available within {waited:?}")]
   Exhausted { waited: Duration },

   /// Pool has been closed and cannot be used
   #[error("pool has been closed")]
   Closed,

   /// Configuration rejected by [`PoolConfiguration::validate`](crate::PoolConfiguration::validate)
   #[error("invalid pool configuration: {0}")]
   InvalidConfiguration(String),
}

impl Error {
   /// True for errors a caller may reasonably retry at a higher level.
   pub fn is_contention(&self) -> bool {
      matches!(self, Error::Exhausted { .. })
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
