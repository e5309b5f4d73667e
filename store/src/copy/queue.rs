//! A small blocking message queue; the graph driver and its workers talk
//! through two of these.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug)]
pub struct Queue<T> {
  items: Mutex<VecDeque<T>>,
  popper_cv: Condvar,
}

impl<T> Queue<T> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
      popper_cv: Condvar::new(),
    }
  }

  pub fn push(&self, item: T) {
    self.items.lock().push_back(item);
    self.popper_cv.notify_one();
  }

  pub fn pop(&self, timeout: Duration) -> Option<T> {
    let mut items = self.items.lock();
    if items.is_empty() {
      let result = self.popper_cv.wait_for(&mut items, timeout);
      if result.timed_out() && items.is_empty() {
        return None;
      }
    }
    items.pop_front()
  }

  pub fn try_pop_all(&self) -> Vec<T> {
    self.items.lock().drain(..).collect()
  }
}

impl<T> Default for Queue<T> {
  fn default() -> Self {
    Self::new()
  }
}
