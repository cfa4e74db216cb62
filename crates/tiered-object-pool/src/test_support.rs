//! In-memory objects and factory shared by the unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::BoxError;
use crate::object::{FactoryGauge, ObjectFactory, PooledObject, Tier};

#[derive(Debug)]
pub(crate) struct TestObject {
   pub id: usize,
   pub tier: Tier,
   pub tag: bool,
   pub keys: Vec<String>,
   pub passive: bool,
}

impl PooledObject for TestObject {
   type Key = str;

   fn tier(&self) -> Tier {
      self.tier
   }

   fn tag(&self) -> bool {
      self.tag
   }

   fn set_tag(&mut self, tag: bool) {
      self.tag = tag;
   }

   fn matches(&self, key: &str) -> bool {
      self.keys.iter().any(|k| k == key)
   }
}

#[derive(Default)]
pub(crate) struct TestFactory {
   next_id: AtomicUsize,
   idle: AtomicUsize,
   live: AtomicUsize,
   fail_next: AtomicBool,
   invalid: Mutex<HashSet<usize>>,
   destroyed: Mutex<Vec<usize>>,
}

impl TestFactory {
   pub fn made(&self) -> usize {
      self.next_id.load(Ordering::SeqCst)
   }

   pub fn destroyed(&self) -> Vec<usize> {
      self.destroyed.lock().clone()
   }

   pub fn fail_next_make(&self) {
      self.fail_next.store(true, Ordering::SeqCst);
   }

   pub fn invalidate(&self, id: usize) {
      self.invalid.lock().insert(id);
   }

   fn make(&self, tier: Tier) -> Result<TestObject, BoxError> {
      if self.fail_next.swap(false, Ordering::SeqCst) {
         return Err("unable to open".into());
      }
      self.live.fetch_add(1, Ordering::SeqCst);
      Ok(TestObject {
         id: self.next_id.fetch_add(1, Ordering::SeqCst),
         tier,
         tag: false,
         keys: Vec::new(),
         passive: false,
      })
   }
}

impl ObjectFactory<TestObject> for TestFactory {
   fn make_object(&self) -> Result<TestObject, BoxError> {
      self.make(Tier::Secondary)
   }

   fn make_primary_object(&self) -> Result<TestObject, BoxError> {
      self.make(Tier::Primary)
   }

   fn activate_object(&self, obj: &mut TestObject) {
      if std::mem::replace(&mut obj.passive, false) {
         self.idle.fetch_sub(1, Ordering::SeqCst);
      }
   }

   fn passivate_object(&self, obj: &mut TestObject) {
      if !std::mem::replace(&mut obj.passive, true) {
         self.idle.fetch_add(1, Ordering::SeqCst);
      }
   }

   fn destroy_object(&self, obj: TestObject) -> Result<(), BoxError> {
      if obj.passive {
         self.idle.fetch_sub(1, Ordering::SeqCst);
      }
      self.live.fetch_sub(1, Ordering::SeqCst);
      self.destroyed.lock().push(obj.id);
      Ok(())
   }

   fn validate_object(&self, obj: &TestObject) -> bool {
      !self.invalid.lock().contains(&obj.id)
   }

   fn gauge(&self) -> FactoryGauge {
      let live = self.live.load(Ordering::SeqCst);
      let idle = self.idle.load(Ordering::SeqCst);
      FactoryGauge {
         num_active: live - idle,
         num_idle: idle,
      }
   }
}
