//! Event queue
//!
//! Bounded hand-off from a session's reader thread to any number of consumers. Order is
//! arrival order. When full, the oldest unread event is evicted to make room and counted in
//! [`EventQueue::overflow_count`]; consumers that must not miss events should drain promptly.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::protocol::KarbonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Faulted(io::ErrorKind),
    Closed,
}

struct Inner {
    events: VecDeque<Event>,
    overflow: u64,
    status: Status,
    fault_message: String,
}

/// Bounded, ordered, drop-oldest event queue
pub struct EventQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity),
                overflow: 0,
                status: Status::Open,
                fault_message: String::new(),
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event, evicting the oldest if full. Returns `true` if one was evicted.
    pub fn push(&self, event: Event) -> bool {
        let mut inner = self.lock();
        let evicted = if inner.events.len() >= self.capacity {
            inner.events.pop_front();
            inner.overflow += 1;
            true
        } else {
            false
        };
        inner.events.push_back(event);
        drop(inner);
        // Selective waiters may pass on this event, so every waiter rechecks
        self.available.notify_all();
        evicted
    }

    /// Take the oldest event without waiting
    pub fn try_pop(&self) -> Result<Event, KarbonError> {
        let mut inner = self.lock();
        match inner.events.pop_front() {
            Some(event) => Ok(event),
            None => Err(Self::empty_error(&inner).unwrap_or(KarbonError::WouldBlock)),
        }
    }

    /// Take the oldest event, waiting up to `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Event, KarbonError> {
        let mut inner = self.wait_for_event(Some(timeout))?;
        inner.events.pop_front().ok_or(KarbonError::Timeout)
    }

    /// Take the oldest event, waiting until one arrives or the queue is closed
    pub fn pop_blocking(&self) -> Result<Event, KarbonError> {
        let mut inner = self.wait_for_event(None)?;
        inner.events.pop_front().ok_or(KarbonError::Timeout)
    }

    /// Look at the oldest event without removing it, waiting up to `timeout`
    pub fn peek_timeout(&self, timeout: Duration) -> Result<Event, KarbonError> {
        let inner = self.wait_for_event(Some(timeout))?;
        inner.events.front().cloned().ok_or(KarbonError::Timeout)
    }

    /// Take the first queued event `select` accepts, waiting up to `timeout` for one to arrive.
    ///
    /// Events `select` rejects stay queued in order. `select` may be called more than once for
    /// the same event.
    pub fn take_matching<T, F>(&self, timeout: Duration, mut select: F) -> Result<T, KarbonError>
    where
        F: FnMut(&Event) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let found = inner
                .events
                .iter()
                .enumerate()
                .find_map(|(pos, event)| select(event).map(|value| (pos, value)));
            if let Some((pos, value)) = found {
                inner.events.remove(pos);
                return Ok(value);
            }
            if let Some(err) = Self::empty_error(&inner) {
                return Err(err);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(KarbonError::Timeout);
            }
            inner = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<Event> {
        self.lock().events.drain(..).collect()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Most events held before the oldest is dropped
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events evicted because the queue was full
    pub fn overflow_count(&self) -> u64 {
        self.lock().overflow
    }

    /// Stop accepting waits; blocked consumers return [`KarbonError::NotOpen`] once drained
    pub fn close(&self) {
        self.lock().status = Status::Closed;
        self.available.notify_all();
    }

    /// Record a reader failure; blocked consumers return it once drained
    pub fn fault(&self, error: &io::Error) {
        let mut inner = self.lock();
        inner.status = Status::Faulted(error.kind());
        inner.fault_message = error.to_string();
        drop(inner);
        self.available.notify_all();
    }

    fn empty_error(inner: &Inner) -> Option<KarbonError> {
        match inner.status {
            Status::Open => None,
            Status::Closed => Some(KarbonError::NotOpen),
            Status::Faulted(kind) => Some(KarbonError::IoError(io::Error::new(
                kind,
                inner.fault_message.clone(),
            ))),
        }
    }

    fn wait_for_event(
        &self,
        timeout: Option<Duration>,
    ) -> Result<MutexGuard<'_, Inner>, KarbonError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if !inner.events.is_empty() {
                return Ok(inner);
            }
            if let Some(err) = Self::empty_error(&inner) {
                return Err(err);
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(KarbonError::Timeout);
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn line(n: usize) -> Event {
        Event::TerminalLine {
            text: n.to_string(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(8);
        for n in 0..5 {
            queue.push(line(n));
        }
        let got: Vec<Event> = (0..5).map(|_| queue.try_pop().unwrap()).collect();
        assert_eq!(got, (0..5).map(line).collect::<Vec<_>>());
        assert!(matches!(queue.try_pop(), Err(KarbonError::WouldBlock)));
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        for capacity in [1usize, 3, 10] {
            for pushes in [0usize, 1, capacity, capacity + 1, capacity * 3 + 2] {
                let queue = EventQueue::new(capacity);
                for n in 0..pushes {
                    queue.push(line(n));
                    assert!(queue.len() <= capacity);
                }
                let kept = queue.drain();
                let expected: Vec<Event> = (pushes.saturating_sub(capacity)..pushes).map(line).collect();
                assert_eq!(kept, expected);
                assert_eq!(queue.overflow_count(), pushes.saturating_sub(capacity) as u64);
            }
        }
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue = EventQueue::new(4);
        let start = Instant::now();
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(20)),
            Err(KarbonError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = EventQueue::new(4);
        queue.push(line(1));
        assert_eq!(queue.peek_timeout(Duration::from_millis(1)).unwrap(), line(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(EventQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(matches!(waiter.join().unwrap(), Err(KarbonError::NotOpen)));
    }

    #[test]
    fn test_closed_queue_still_drains() {
        let queue = EventQueue::new(4);
        queue.push(line(7));
        queue.close();
        assert_eq!(queue.pop_blocking().unwrap(), line(7));
        assert!(matches!(queue.pop_blocking(), Err(KarbonError::NotOpen)));
    }

    #[test]
    fn test_fault_is_reported() {
        let queue = EventQueue::new(4);
        queue.fault(&io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        match queue.try_pop() {
            Err(KarbonError::IoError(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_take_matching_leaves_other_events() {
        let queue = Arc::new(EventQueue::new(8));
        queue.push(line(1));
        queue.push(line(2));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(line(30));
            })
        };
        let taken = queue.take_matching(Duration::from_secs(5), |event| match event {
            Event::TerminalLine { text } if text.len() == 2 => Some(text.clone()),
            _ => None,
        });
        producer.join().unwrap();

        assert_eq!(taken.unwrap(), "30");
        assert_eq!(queue.drain(), vec![line(1), line(2)]);
        assert!(matches!(
            queue.take_matching(Duration::from_millis(5), |_| Some(())),
            Err(KarbonError::Timeout)
        ));
    }

    #[test]
    fn test_producer_consumer_order() {
        let queue = Arc::new(EventQueue::new(1000));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for n in 0..500 {
                    queue.push(line(n));
                }
            })
        };
        let mut got = Vec::new();
        while got.len() < 500 {
            got.push(queue.pop_timeout(Duration::from_secs(5)).unwrap());
        }
        producer.join().unwrap();
        assert_eq!(got, (0..500).map(line).collect::<Vec<_>>());
    }
}
