//! Background eviction sweeps
//!
//! Each tier gets its own periodic task on a caller-supplied tokio runtime.
//! Tasks hold only a weak reference to their pool and stop once the pool is
//! closed or dropped. The sweep itself runs on the blocking thread pool since
//! destroying an object may block on native I/O.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

/// A pool tier that can be swept for idle objects.
pub(crate) trait Evict: Send + Sync + 'static {
   /// Runs one sweep, returning how many objects were destroyed.
   fn evict(&self) -> usize;

   fn is_closed(&self) -> bool;
}

/// Handle to a scheduled sweep; aborts the task when dropped.
pub(crate) struct EvictionTask {
   handle: JoinHandle<()>,
}

impl Drop for EvictionTask {
   fn drop(&mut self) {
      self.handle.abort();
   }
}

pub(crate) fn schedule<P: Evict>(
   runtime: &Handle,
   pool: &Arc<P>,
   tier: &'static str,
   interval: Duration,
) -> EvictionTask {
   let pool: Weak<P> = Arc::downgrade(pool);
   let handle = runtime.spawn(async move {
      let mut ticker = interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
         ticker.tick().await;
         let Some(pool) = pool.upgrade() else {
            break;
         };
         if pool.is_closed() {
            break;
         }
         match tokio::task::spawn_blocking(move || pool.evict()).await {
            Ok(0) => trace!(tier, "Eviction sweep found nothing to evict"),
            Ok(evicted) => debug!(tier, evicted, "Eviction sweep destroyed idle objects"),
            Err(e) => debug!(tier, error = %e, "Eviction sweep did not complete"),
         }
      }
      trace!(tier, "Eviction task stopped");
   });
   EvictionTask { handle }
}
