//! Secondary tier: a bounded pool of interchangeable objects

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::eviction::Evict;
use crate::object::{ObjectFactory, ObjectPool, PooledObject, destroy_quietly};
use crate::{Error, Result};

struct IdleObject<T> {
   object: T,
   since: Instant,
}

struct State<T> {
   /// Oldest first; returns push to the back.
   idle: VecDeque<IdleObject<T>>,
   /// Every live object: idle, checked out, or under construction.
   total: usize,
   closed: bool,
}

/// Pool of up to `max_total` objects built with [`ObjectFactory::make_object`].
///
/// Borrowing prefers the most recently returned idle object matching the
/// key, then any idle object, then a new one while capacity remains, and
/// otherwise waits for a return. Waiters are woken one per return.
pub struct BoundedObjectPool<T, F> {
   factory: Arc<F>,
   state: Mutex<State<T>>,
   returned: Condvar,
   max_total: usize,
   min_idle: usize,
   eviction_delay: Duration,
   borrow_timeout: Option<Duration>,
}

impl<T, F> BoundedObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   pub fn new(
      factory: Arc<F>,
      max_total: usize,
      min_idle: usize,
      eviction_delay: Duration,
      borrow_timeout: Option<Duration>,
   ) -> Self {
      Self {
         factory,
         state: Mutex::new(State {
            idle: VecDeque::new(),
            total: 0,
            closed: false,
         }),
         returned: Condvar::new(),
         max_total,
         min_idle: min_idle.min(max_total),
         eviction_delay,
         borrow_timeout,
      }
   }

   pub fn borrow_object(&self) -> Result<T> {
      self.borrow(None)
   }

   pub fn borrow_object_for(&self, key: &T::Key) -> Result<T> {
      self.borrow(Some(key))
   }

   pub fn return_object(&self, mut object: T) {
      self.factory.passivate_object(&mut object);
      let mut state = self.state.lock();
      if state.closed {
         state.total -= 1;
         drop(state);
         debug!("Secondary object returned after close, destroying");
         destroy_quietly(&*self.factory, object);
         return;
      }
      state.idle.push_back(IdleObject {
         object,
         since: Instant::now(),
      });
      drop(state);
      self.returned.notify_one();
   }

   pub fn max_total(&self) -> usize {
      self.max_total
   }

   pub fn num_idle(&self) -> usize {
      self.state.lock().idle.len()
   }

   pub fn num_active(&self) -> usize {
      let state = self.state.lock();
      state.total - state.idle.len()
   }

   pub fn close(&self) {
      let mut state = self.state.lock();
      state.closed = true;
      let drained: Vec<T> = state.idle.drain(..).map(|entry| entry.object).collect();
      state.total -= drained.len();
      drop(state);
      self.returned.notify_all();
      for object in drained {
         destroy_quietly(&*self.factory, object);
      }
   }

   pub fn is_closed(&self) -> bool {
      self.state.lock().closed
   }

   /// Destroys idle objects idle for at least the eviction delay, oldest
   /// first, without dropping below the `min_idle` floor.
   ///
   /// Survivors are marked; a survivor still marked on the next sweep is
   /// revalidated and destroyed if validation fails. Returns the number of
   /// objects destroyed.
   pub fn evict(&self) -> usize {
      let mut state = self.state.lock();
      let mut doomed = Vec::new();
      while state.idle.len() > self.min_idle
         && state
            .idle
            .front()
            .is_some_and(|entry| entry.since.elapsed() >= self.eviction_delay)
      {
         if let Some(entry) = state.idle.pop_front() {
            doomed.push(entry.object);
         }
      }

      let mut survivors = VecDeque::with_capacity(state.idle.len());
      for mut entry in state.idle.drain(..) {
         if !entry.object.tag() {
            entry.object.set_tag(true);
            survivors.push_back(entry);
         } else if self.factory.validate_object(&entry.object) {
            survivors.push_back(entry);
         } else {
            warn!("Idle secondary object failed revalidation");
            doomed.push(entry.object);
         }
      }
      state.idle = survivors;
      state.total -= doomed.len();
      drop(state);

      let evicted = doomed.len();
      if evicted > 0 {
         trace!(evicted, "Evicting idle secondary objects");
         self.returned.notify_all();
      }
      for object in doomed {
         destroy_quietly(&*self.factory, object);
      }
      evicted
   }

   fn borrow(&self, key: Option<&T::Key>) -> Result<T> {
      let deadline = self.borrow_timeout.map(|timeout| Instant::now() + timeout);
      let mut state = self.state.lock();
      loop {
         if state.closed {
            return Err(Error::Closed);
         }

         if let Some(index) = pick(&state.idle, key) {
            let Some(entry) = state.idle.remove(index) else {
               continue;
            };
            drop(state);
            match self.activate(entry.object) {
               Some(object) => return Ok(object),
               None => {
                  state = self.state.lock();
                  state.total -= 1;
                  continue;
               }
            }
         }

         if state.total < self.max_total {
            state.total += 1;
            drop(state);
            return match self.factory.make_object() {
               Ok(object) => {
                  debug!("Constructed secondary object");
                  Ok(object)
               }
               Err(e) => {
                  self.state.lock().total -= 1;
                  self.returned.notify_one();
                  Err(Error::Factory(e))
               }
            };
         }

         match deadline {
            Some(deadline) => {
               if self.returned.wait_until(&mut state, deadline).timed_out()
                  && state.idle.is_empty()
                  && state.total >= self.max_total
                  && !state.closed
               {
                  return Err(Error::Exhausted {
                     waited: self.borrow_timeout.unwrap_or_default(),
                  });
               }
            }
            None => self.returned.wait(&mut state),
         }
      }
   }

   /// Validates and activates an idle object, destroying it on failure.
   fn activate(&self, mut object: T) -> Option<T> {
      object.set_tag(false);
      if !self.factory.validate_object(&object) {
         warn!("Idle secondary object failed validation, destroying it");
         destroy_quietly(&*self.factory, object);
         return None;
      }
      self.factory.activate_object(&mut object);
      Some(object)
   }
}

/// Most recently returned idle object matching `key`, else the most recent.
fn pick<T: PooledObject>(idle: &VecDeque<IdleObject<T>>, key: Option<&T::Key>) -> Option<usize> {
   if idle.is_empty() {
      return None;
   }
   key
      .and_then(|key| idle.iter().rposition(|entry| entry.object.matches(key)))
      .or(Some(idle.len() - 1))
}

impl<T, F> ObjectPool<T> for BoundedObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn borrow_object(&self) -> Result<T> {
      BoundedObjectPool::borrow_object(self)
   }

   fn borrow_object_for(&self, key: &T::Key) -> Result<T> {
      BoundedObjectPool::borrow_object_for(self, key)
   }

   fn return_object(&self, obj: T) {
      BoundedObjectPool::return_object(self, obj)
   }

   fn close(&self) {
      BoundedObjectPool::close(self)
   }
}

impl<T, F> Evict for BoundedObjectPool<T, F>
where
   T: PooledObject,
   F: ObjectFactory<T>,
{
   fn evict(&self) -> usize {
      BoundedObjectPool::evict(self)
   }

   fn is_closed(&self) -> bool {
      BoundedObjectPool::is_closed(self)
   }
}
