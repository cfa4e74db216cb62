//! Configuration for tiered object pools

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for a [`TieredObjectPool`](crate::TieredObjectPool)
///
/// Immutable once a pool has been built from it.
///
/// # Examples
///
/// ```
/// use tiered_object_pool::PoolConfiguration;
///
/// // Use defaults
/// let config = PoolConfiguration::default();
///
/// // Override just a couple of fields
/// let config = PoolConfiguration {
///    max_total: 4,
///    eviction_delay_millis: 5_000,
///    ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
   /// Minimum time an object must sit idle before a sweep may destroy it
   ///
   /// Default: 20 seconds
   pub eviction_delay_millis: u64,

   /// How often the eviction sweep runs; zero disables the sweep
   ///
   /// Default: 60 seconds
   pub eviction_interval_millis: u64,

   /// Maximum number of objects across both tiers, including the primary
   ///
   /// A value of 1 collapses the pool to the primary tier alone.
   ///
   /// Default: 10
   pub max_total: usize,

   /// Secondary-tier floor: eviction never leaves fewer idle objects than this
   ///
   /// Default: 0
   pub min_idle: usize,

   /// How long a borrow may block waiting for an object; `None` waits forever
   ///
   /// Default: 30 seconds
   pub borrow_timeout_millis: Option<u64>,
}

impl Default for PoolConfiguration {
   fn default() -> Self {
      Self {
         eviction_delay_millis: 20_000,
         eviction_interval_millis: 60_000,
         max_total: 10,
         min_idle: 0,
         borrow_timeout_millis: Some(30_000),
      }
   }
}

impl PoolConfiguration {
   pub fn eviction_delay(&self) -> Duration {
      Duration::from_millis(self.eviction_delay_millis)
   }

   /// The sweep period, or `None` when eviction is disabled.
   pub fn eviction_interval(&self) -> Option<Duration> {
      (self.eviction_interval_millis > 0).then(|| Duration::from_millis(self.eviction_interval_millis))
   }

   pub fn borrow_timeout(&self) -> Option<Duration> {
      self.borrow_timeout_millis.map(Duration::from_millis)
   }

   pub fn validate(&self) -> Result<()> {
      if self.max_total == 0 {
         return Err(Error::InvalidConfiguration(
            "max_total must be at least 1".to_string(),
         ));
      }
      if self.min_idle > self.max_total {
         return Err(Error::InvalidConfiguration(format!(
            "min_idle ({}) exceeds max_total ({})",
            self.min_idle, self.max_total
         )));
      }
      Ok(())
   }
}
