//! # tiered-object-pool
//!
//! A blocking object pool that splits its capacity into two tiers, built for
//! expensive native handles such as SQLite connections.
//!
//! ## Core Types
//!
//! - **[`TieredObjectPool`]**: one borrow/return contract over both tiers
//! - **[`SingleObjectPool`]**: the primary tier, exactly one lazily built object
//! - **[`BoundedObjectPool`]**: the secondary tier, up to `max_total - 1` objects
//! - **[`ObjectFactory`]** / **[`PooledObject`]**: what the pool needs from its objects
//! - **[`PoolConfiguration`]**: eviction and capacity settings
//! - **[`Error`]**: error type for pool operations
//!
//! ## Architecture
//!
//! - **Reserved primary**: the first borrow takes the primary object when it is
//!   free; write paths can insist on it with
//!   [`TieredObjectPool::borrow_primary_object`]
//! - **Bounded overflow**: concurrent and keyed borrows fall to the secondary tier,
//!   blocking up to the borrow timeout when it is at capacity
//! - **Idle eviction**: periodic sweeps on a tokio runtime destroy objects idle
//!   past the eviction delay; checked-out objects are never candidates

mod bounded;
mod config;
mod error;
mod eviction;
mod object;
mod single;
mod tiered;

#[cfg(test)]
mod test_support;

pub use bounded::BoundedObjectPool;
pub use config::PoolConfiguration;
pub use error::{BoxError, Error, Result};
pub use object::{FactoryGauge, ObjectFactory, ObjectPool, PooledObject, Tier};
pub use single::SingleObjectPool;
pub use tiered::{TieredObjectPool, create_object_pool};
