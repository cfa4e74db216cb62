//! Primary and secondary tiers behind one borrow/return contract

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::bounded::BoundedObjectPool;
use crate::config::PoolConfiguration;
use crate::eviction::{self, EvictionTask};
use crate::object::{FactoryGauge, ObjectFactory, ObjectPool, PooledObject, Tier, destroy_quietly};
use crate::single::SingleObjectPool;
use crate::Result;

/// Builds a [`TieredObjectPool`] and schedules its eviction sweeps on `runtime`.
///
/// With `max_total == 1` the pool is primary-only; otherwise the secondary
/// tier holds up to `max_total - 1` objects, one slot being reserved for the
/// primary object.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tiered_object_pool::{ObjectFactory, PooledObject, PoolConfiguration, create_object_pool};
/// # fn build<T: PooledObject, F: ObjectFactory<T>>(
/// #    factory: F,
/// #    runtime: &tokio::runtime::Handle,
/// # ) -> tiered_object_pool::Result<()> {
/// let pool = create_object_pool(Arc::new(factory), runtime, PoolConfiguration::default())?;
/// let object = pool.borrow_primary_object()?;
/// pool.return_object(object);
/// # Ok(())
/// # }
/// ```
pub fn create_object_pool<T, F>(
   factory: Arc<F>,
   runtime: &Handle,
   configuration: PoolConfiguration,
) -> Result<TieredObjectPool<T, F>>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   let pool = TieredObjectPool::new(factory, &configuration)?;
   if let Some(interval) = configuration.eviction_interval() {
      pool.schedule_eviction(runtime, interval);
   }
   Ok(pool)
}

/// One reserved primary object plus an optional bounded secondary tier.
///
/// Write transactions go through the primary object so that they serialize
/// on one well-known handle; other work may fan out over the secondary tier.
/// Dropping the pool closes it.
pub struct TieredObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   factory: Arc<F>,
   primary: Arc<SingleObjectPool<T, F>>,
   secondary: Option<Arc<BoundedObjectPool<T, F>>>,
   eviction: Mutex<Vec<EvictionTask>>,
}

impl<T, F> TieredObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   /// Builds the tiers without scheduling any eviction; see
   /// [`create_object_pool`] for the scheduled variant.
   pub fn new(factory: Arc<F>, configuration: &PoolConfiguration) -> Result<Self> {
      configuration.validate()?;
      let primary = Arc::new(SingleObjectPool::new(
         Arc::clone(&factory),
         configuration.eviction_delay(),
         configuration.borrow_timeout(),
      ));
      let secondary = (configuration.max_total > 1).then(|| {
         Arc::new(BoundedObjectPool::new(
            Arc::clone(&factory),
            configuration.max_total - 1,
            configuration.min_idle,
            configuration.eviction_delay(),
            configuration.borrow_timeout(),
         ))
      });
      debug!(
         max_total = configuration.max_total,
         primary_only = secondary.is_none(),
         "Created tiered object pool"
      );
      Ok(Self {
         factory,
         primary,
         secondary,
         eviction: Mutex::new(Vec::new()),
      })
   }

   /// Starts periodic eviction sweeps for every tier on `runtime`, replacing
   /// any sweeps scheduled before.
   pub fn schedule_eviction(&self, runtime: &Handle, interval: std::time::Duration) {
      let mut tasks = self.eviction.lock();
      tasks.clear();
      tasks.push(eviction::schedule(runtime, &self.primary, "primary", interval));
      if let Some(secondary) = &self.secondary {
         tasks.push(eviction::schedule(runtime, secondary, "secondary", interval));
      }
   }

   /// Borrows the primary object if it is free, otherwise falls back to the
   /// secondary tier (or waits for the primary when there is none).
   pub fn borrow_object(&self) -> Result<T> {
      if let Some(object) = self.primary.try_borrow_object()? {
         return Ok(object);
      }
      match &self.secondary {
         Some(secondary) => secondary.borrow_object(),
         None => self.primary.borrow_object(),
      }
   }

   /// Borrows from the secondary tier, preferring an object matching `key`.
   pub fn borrow_object_for(&self, key: &T::Key) -> Result<T> {
      match &self.secondary {
         Some(secondary) => secondary.borrow_object_for(key),
         None => self.primary.borrow_object(),
      }
   }

   /// Borrows the primary object, waiting while it is checked out.
   pub fn borrow_primary_object(&self) -> Result<T> {
      self.primary.borrow_object()
   }

   /// Hands `object` back to the tier named by its [`Tier`].
   pub fn return_object(&self, object: T) {
      match (object.tier(), &self.secondary) {
         (Tier::Primary, _) => self.primary.return_object(object),
         (Tier::Secondary, Some(secondary)) => secondary.return_object(object),
         (Tier::Secondary, None) => {
            warn!("Secondary object returned to a primary-only pool, destroying");
            destroy_quietly(&*self.factory, object);
         }
      }
   }

   /// Runs one eviction sweep over every tier.
   pub fn evict(&self) -> usize {
      self.primary.evict() + self.secondary.as_ref().map_or(0, |secondary| secondary.evict())
   }

   pub fn close(&self) {
      self.eviction.lock().clear();
      self.primary.close();
      if let Some(secondary) = &self.secondary {
         secondary.close();
      }
   }

   pub fn is_closed(&self) -> bool {
      self.primary.is_closed()
   }

   pub fn is_primary_only(&self) -> bool {
      self.secondary.is_none()
   }

   /// Capacity of the secondary tier (zero when primary-only).
   pub fn secondary_capacity(&self) -> usize {
      self.secondary.as_ref().map_or(0, |secondary| secondary.max_total())
   }

   /// True while the primary object is checked out.
   pub fn is_primary_busy(&self) -> bool {
      self.primary.is_busy()
   }

   pub fn gauge(&self) -> FactoryGauge {
      self.factory.gauge()
   }
}

impl<T, F> ObjectPool<T> for TieredObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn borrow_object(&self) -> Result<T> {
      TieredObjectPool::borrow_object(self)
   }

   fn borrow_object_for(&self, key: &T::Key) -> Result<T> {
      TieredObjectPool::borrow_object_for(self, key)
   }

   fn return_object(&self, obj: T) {
      TieredObjectPool::return_object(self, obj)
   }

   fn close(&self) {
      TieredObjectPool::close(self)
   }
}

impl<T, F> Drop for TieredObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn drop(&mut self) {
      self.close();
   }
}
