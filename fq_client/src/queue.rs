// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # BOUNDED QUEUE
//!
//! The channel type behind the publish queue, the back-channel, and the
//! instruction queue. Unlike a std mpsc channel it can report its depth,
//! which the non-blocking publish path and the backlog accessor both need,
//! and its single lock is what closes the check-then-send race between
//! depth inspection and enqueue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct BoundedQueue<T> {
  cap: usize,
  items: Mutex<VecDeque<T>>,
  not_empty: Condvar,
  not_full: Condvar,
}

impl<T> BoundedQueue<T> {
  pub fn new(cap: usize) -> Self {
    BoundedQueue {
      cap: cap.max(1),
      items: Mutex::new(VecDeque::new()),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.items.lock().unwrap().len()
  }

  /// Blocks while the queue is full.
  pub fn push(&self, item: T) {
    let mut items = self.items.lock().unwrap();
    while items.len() >= self.cap {
      items = self.not_full.wait(items).unwrap();
    }
    items.push_back(item);
    self.not_empty.notify_one();
  }

  /// Never blocks; `false` means the queue was full at entry.
  pub fn try_push(&self, item: T) -> bool {
    let mut items = self.items.lock().unwrap();
    if items.len() >= self.cap {
      return false;
    }
    items.push_back(item);
    self.not_empty.notify_one();
    true
  }

  /// Never blocks.
  pub fn try_pop(&self) -> Option<T> {
    let mut items = self.items.lock().unwrap();
    let item = items.pop_front();
    if item.is_some() {
      self.not_full.notify_one();
    }
    item
  }

  /// Waits up to `timeout` for an item.
  pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut items = self.items.lock().unwrap();
    loop {
      if let Some(item) = items.pop_front() {
        self.not_full.notify_one();
        return Some(item);
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      let (guard, _timeout) = self.not_empty.wait_timeout(items, deadline - now).unwrap();
      items = guard;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn try_push_respects_the_bound() {
    let queue: BoundedQueue<u32> = BoundedQueue::new(2);
    assert!(queue.try_push(1));
    assert!(queue.try_push(2));
    assert!(!queue.try_push(3));
    assert_eq!(queue.len(), 2);
  }

  #[test]
  fn fifo_order() {
    let queue: BoundedQueue<u32> = BoundedQueue::new(8);
    queue.push(1);
    queue.push(2);
    queue.push(3);
    assert_eq!(queue.try_pop(), Some(1));
    assert_eq!(queue.try_pop(), Some(2));
    assert_eq!(queue.try_pop(), Some(3));
    assert_eq!(queue.try_pop(), None);
  }

  #[test]
  fn pop_timeout_expires_empty() {
    let queue: BoundedQueue<u32> = BoundedQueue::new(2);
    let start = Instant::now();
    assert_eq!(queue.pop_timeout(Duration::from_millis(50)), None);
    assert!(start.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn pop_unblocks_a_full_push() {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
    queue.push(1);
    let pusher = {
      let queue = queue.clone();
      thread::spawn(move || queue.push(2))
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.try_pop(), Some(1));
    pusher.join().unwrap();
    assert_eq!(queue.try_pop(), Some(2));
  }

  #[test]
  fn pop_timeout_sees_a_late_push() {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
    let popper = {
      let queue = queue.clone();
      thread::spawn(move || queue.pop_timeout(Duration::from_secs(2)))
    };
    thread::sleep(Duration::from_millis(20));
    queue.push(9);
    assert_eq!(popper.join().unwrap(), Some(9));
  }
}
