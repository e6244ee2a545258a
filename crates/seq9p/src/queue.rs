//! FIFO queues for requests that are on the wire and awaiting replies.

use std::collections::VecDeque;
use std::sync::Mutex;

/// An unsynchronised FIFO.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue {
            items: VecDeque::new(),
        }
    }
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue::default()
    }

    pub fn put(&mut self, x: T) {
        self.items.push_back(x);
    }

    pub fn get(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Take back the entry put most recently.
    pub fn take_last(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keep only the entries matching `f`, preserving their order.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }
}

/// A FIFO shared between tasks.
#[derive(Debug)]
pub struct SyncQueue<T> {
    q: Mutex<Queue<T>>,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        SyncQueue {
            q: Mutex::new(Queue::new()),
        }
    }
}

impl<T> SyncQueue<T> {
    pub fn new() -> SyncQueue<T> {
        SyncQueue::default()
    }

    pub fn put(&self, x: T) {
        self.lock().put(x);
    }

    pub fn get(&self) -> Option<T> {
        self.lock().get()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue<T>> {
        self.q.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = Queue::new();
        q.put(1);
        q.put(2);
        q.put(3);
        q.put(4);
        assert_eq!(q.take_last(), Some(4));
        assert_eq!(q.get(), Some(1));
        q.retain(|x| *x != 2);
        assert_eq!(q.get(), Some(3));
        assert!(q.get().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn shared_queue_across_threads() {
        let q = std::sync::Arc::new(SyncQueue::new());
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    q.put(i);
                }
            })
        };
        producer.join().unwrap();
        assert_eq!(q.len(), 100);
        let drained: Vec<_> = std::iter::from_fn(|| q.get()).collect();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }
}
