//! A capacity-bounded pool of reusable resources, used for remote store
//! connections. Acquisition blocks when the pool is at capacity; handles
//! return their resource on drop unless the health predicate rejects it.

use crate::*;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};

type Factory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Pool<T> {
  state: Mutex<State<T>>,
  wakeup: Condvar,
  capacity: usize,
  factory: Factory<T>,
  valid: Validator<T>,
}

struct State<T> {
  idle: Vec<T>,
  in_use: usize,
}

impl<T> Pool<T> {
  pub fn new(
    capacity: usize,
    factory: impl Fn() -> Result<T> + Send + Sync + 'static,
    valid: impl Fn(&T) -> bool + Send + Sync + 'static,
  ) -> Self {
    Self {
      state: Mutex::new(State {
        idle: Vec::new(),
        in_use: 0,
      }),
      wakeup: Condvar::new(),
      capacity: capacity.max(1),
      factory: Box::new(factory),
      valid: Box::new(valid),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Take an idle resource, or create one if under capacity, or block.
  pub fn get(&self) -> Result<PoolHandle<'_, T>> {
    let item = {
      let mut state = self.state.lock();
      loop {
        if let Some(item) = state.idle.pop() {
          if (self.valid)(&item) {
            state.in_use += 1;
            break Some(item);
          }
          // unhealthy: drop it and look again
          continue;
        }
        if state.in_use < self.capacity {
          state.in_use += 1;
          break None;
        }
        self.wakeup.wait(&mut state);
      }
    };

    let item = match item {
      Some(item) => item,
      None => match (self.factory)() {
        Ok(item) => item,
        Err(e) => {
          self.state.lock().in_use -= 1;
          self.wakeup.notify_one();
          return Err(e);
        }
      },
    };

    Ok(PoolHandle {
      pool: self,
      item: Some(item),
    })
  }

  fn put_back(&self, item: T) {
    let mut state = self.state.lock();
    state.in_use -= 1;
    if (self.valid)(&item) {
      state.idle.push(item);
    }
    self.wakeup.notify_one();
  }
}

pub struct PoolHandle<'a, T> {
  pool: &'a Pool<T>,
  item: Option<T>,
}

impl<'a, T> Deref for PoolHandle<'a, T> {
  type Target = T;

  fn deref(&self) -> &T {
    self.item.as_ref().unwrap()
  }
}

impl<'a, T> DerefMut for PoolHandle<'a, T> {
  fn deref_mut(&mut self) -> &mut T {
    self.item.as_mut().unwrap()
  }
}

impl<'a, T> Drop for PoolHandle<'a, T> {
  fn drop(&mut self) {
    if let Some(item) = self.item.take() {
      self.pool.put_back(item);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Conn {
    serial: usize,
    good: bool,
  }

  #[test]
  fn reuses_healthy_resources() {
    let counter = AtomicUsize::new(0);
    let pool = Pool::new(
      2,
      move || {
        Ok(Conn {
          serial: counter.fetch_add(1, Ordering::SeqCst),
          good: true,
        })
      },
      |c: &Conn| c.good,
    );

    // the handle is dropped at the end of each statement, so the same
    // connection is handed out twice
    let first = pool.get().unwrap().serial;
    let second = pool.get().unwrap().serial;
    assert_eq!((first, second), (0, 0));
  }

  #[test]
  fn discards_unhealthy_resources() {
    let counter = AtomicUsize::new(0);
    let pool = Pool::new(
      1,
      move || {
        Ok(Conn {
          serial: counter.fetch_add(1, Ordering::SeqCst),
          good: true,
        })
      },
      |c: &Conn| c.good,
    );

    {
      let mut handle = pool.get().unwrap();
      handle.good = false;
    }
    assert_eq!(pool.get().unwrap().serial, 1);
  }
}
