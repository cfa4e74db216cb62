//! # sqlite-sessions
//!
//! Thread-scoped SQLite sessions with reentrant transactions over a tiered
//! connection pool.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: thread-safe facade for queries and transactions on one file
//! - **[`ThreadScopedSession`]**: one [`SqlSession`] per calling thread
//! - **[`SqlSession`]**: nested transaction state on top of a connection [`Session`]
//! - **[`SqlExecutor`]**: a pooled connection, created by [`SqlExecutorFactory`]
//! - **[`TransactionListener`]**: begin/commit/rollback callbacks for outermost transactions
//! - **[`DatabaseConfiguration`]**: pool and connection settings
//! - **[`Error`]**: error type for session operations
//!
//! ## Architecture
//!
//! - **Primary writer**: transactions always run on the pool's primary connection,
//!   which is the only one allowed to write
//! - **Secondary readers**: reads outside a transaction borrow `query_only`
//!   connections, preferring one that recently prepared the same SQL
//! - **Emulated nesting**: only the outermost begin and end reach SQLite; any
//!   level ending unmarked rolls back the whole transaction
//! - **Cooperative yield**: long transactions can commit and re-begin to let
//!   other writers in

mod config;
mod database;
mod decode;
mod error;
mod executor;
mod factory;
mod listener;
mod session;
mod sql_session;
mod statement;
mod thread_session;

pub use config::DatabaseConfiguration;
pub use database::SqliteDatabase;
pub use decode::{to_json, to_sql};
pub use error::{BoxError, Error, Result};
pub use executor::SqlExecutor;
pub use factory::SqlExecutorFactory;
pub use listener::TransactionListener;
pub use session::Session;
pub use sql_session::{SqlExecutorPool, SqlSession, SqlTransactor, TransactionMode};
pub use statement::SqlStatementType;
pub use thread_session::ThreadScopedSession;
pub use tiered_object_pool::{FactoryGauge, PoolConfiguration};
