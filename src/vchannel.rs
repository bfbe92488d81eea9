//! The channel object backing a remote-value cell.
//!
//! Cells are polymorphic over their channel implementation: anything
//! providing the capability set {put, take, fetch, isready, close, isopen,
//! isempty} can back a cell. [`BoundedChannel`] is the default
//! implementation, covering the unbounded, bounded and rendezvous (capacity
//! zero) shapes.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::ReferenceError;
use crate::proto::Outcome;

/// Capability set of the channel backing a remote-value cell. All methods are
/// callable concurrently; `put` and `take` may block.
pub trait ValueChannel: Send + Sync {
    /// Append a value. Blocks while a bounded channel is full; on a
    /// rendezvous channel, blocks until a taker picked the value up.
    fn put(&self, v: Outcome) -> Result<(), ReferenceError>;
    /// Remove and return the oldest value, blocking while the channel is
    /// empty and open.
    fn take(&self) -> Result<Outcome, ReferenceError>;
    /// Return a copy of the oldest value without removing it, blocking while
    /// the channel is empty and open.
    fn fetch(&self) -> Result<Outcome, ReferenceError>;
    /// Whether a value is immediately available.
    fn is_ready(&self) -> bool;
    /// Close the channel: puts fail from now on, buffered values can still be
    /// drained, blocked operations wake up.
    fn close(&self);
    /// Whether the channel has not been closed.
    fn is_open(&self) -> bool;
    /// Whether no value is buffered.
    fn is_empty(&self) -> bool;
}

struct ChanState<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// Values removed so far. A rendezvous putter watches this advance past
    /// its own value instead of the queue emptying, which a later putter
    /// could have refilled in the meantime.
    taken: u64,
}

/// A blocking FIFO queue with an optional capacity.
///
/// Capacity `None` never blocks producers. Capacity `n > 0` blocks producers
/// while `n` values are buffered. Capacity `0` is a rendezvous: a put blocks
/// until a taker has picked the value up, so producer and consumer meet.
pub struct BoundedChannel<T> {
    capacity: Option<usize>,
    state: Mutex<ChanState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedChannel<T> {
    /// A channel that never blocks producers.
    pub fn unbounded() -> BoundedChannel<T> {
        BoundedChannel::with_capacity(None)
    }

    /// A channel blocking producers at `capacity` buffered values; `0` makes
    /// a rendezvous channel.
    pub fn bounded(capacity: usize) -> BoundedChannel<T> {
        BoundedChannel::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> BoundedChannel<T> {
        BoundedChannel {
            capacity,
            state: Mutex::new(ChanState {
                queue: VecDeque::new(),
                closed: false,
                taken: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append a value, blocking while the channel is full.
    pub fn put(&self, v: T) -> Result<(), ReferenceError> {
        let mut state = self.state.lock().unwrap();
        match self.capacity {
            Some(0) => {
                // one rendezvous in flight at a time
                while !state.queue.is_empty() && !state.closed {
                    state = self.not_full.wait(state).unwrap();
                }
                if state.closed {
                    return Err(ReferenceError::ChannelClosed);
                }
                state.queue.push_back(v);
                let baseline = state.taken;
                self.not_empty.notify_one();
                while state.taken == baseline && !state.closed {
                    state = self.not_full.wait(state).unwrap();
                }
                if state.taken > baseline {
                    Ok(())
                } else {
                    // closed with our value still queued: withdraw it
                    state.queue.clear();
                    Err(ReferenceError::ChannelClosed)
                }
            }
            Some(cap) => {
                while state.queue.len() >= cap && !state.closed {
                    state = self.not_full.wait(state).unwrap();
                }
                if state.closed {
                    return Err(ReferenceError::ChannelClosed);
                }
                state.queue.push_back(v);
                self.not_empty.notify_one();
                Ok(())
            }
            None => {
                if state.closed {
                    return Err(ReferenceError::ChannelClosed);
                }
                state.queue.push_back(v);
                self.not_empty.notify_one();
                Ok(())
            }
        }
    }

    /// Remove and return the oldest value. A closed channel drains its buffer
    /// before failing takes.
    pub fn take(&self) -> Result<T, ReferenceError> {
        let mut state = self.state.lock().unwrap();
        while state.queue.is_empty() && !state.closed {
            state = self.not_empty.wait(state).unwrap();
        }
        match state.queue.pop_front() {
            Some(v) => {
                state.taken += 1;
                self.not_full.notify_all();
                Ok(v)
            }
            None => Err(ReferenceError::ChannelClosed),
        }
    }

    /// Whether a value is immediately available.
    pub fn is_ready(&self) -> bool {
        !self.state.lock().unwrap().queue.is_empty()
    }

    /// How many values are buffered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Whether no value is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the channel, waking up every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the channel has not been closed.
    pub fn is_open(&self) -> bool {
        !self.state.lock().unwrap().closed
    }
}

impl<T: Clone> BoundedChannel<T> {
    /// Return a copy of the oldest value without removing it.
    pub fn fetch(&self) -> Result<T, ReferenceError> {
        let mut state = self.state.lock().unwrap();
        while state.queue.is_empty() && !state.closed {
            state = self.not_empty.wait(state).unwrap();
        }
        match state.queue.front() {
            Some(v) => Ok(v.clone()),
            None => Err(ReferenceError::ChannelClosed),
        }
    }
}

impl ValueChannel for BoundedChannel<Outcome> {
    fn put(&self, v: Outcome) -> Result<(), ReferenceError> {
        BoundedChannel::put(self, v)
    }

    fn take(&self) -> Result<Outcome, ReferenceError> {
        BoundedChannel::take(self)
    }

    fn fetch(&self) -> Result<Outcome, ReferenceError> {
        BoundedChannel::fetch(self)
    }

    fn is_ready(&self) -> bool {
        BoundedChannel::is_ready(self)
    }

    fn close(&self) {
        BoundedChannel::close(self)
    }

    fn is_open(&self) -> bool {
        BoundedChannel::is_open(self)
    }

    fn is_empty(&self) -> bool {
        BoundedChannel::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_unbounded_fifo() {
        let chan = BoundedChannel::unbounded();
        chan.put(1).unwrap();
        chan.put(2).unwrap();
        assert_eq!(chan.fetch().unwrap(), 1);
        assert_eq!(chan.take().unwrap(), 1);
        assert_eq!(chan.take().unwrap(), 2);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_bounded_blocks_producer() {
        let chan = Arc::new(BoundedChannel::bounded(1));
        chan.put(1).unwrap();
        let chan2 = chan.clone();
        let producer = thread::spawn(move || {
            chan2.put(2).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(chan.len(), 1);
        assert_eq!(chan.take().unwrap(), 1);
        producer.join().unwrap();
        assert_eq!(chan.take().unwrap(), 2);
    }

    #[test]
    fn test_rendezvous_meets() {
        let chan = Arc::new(BoundedChannel::bounded(0));
        let chan2 = chan.clone();
        let producer = thread::spawn(move || {
            chan2.put(42).unwrap();
            // the put returned, so the taker has the value
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(chan.take().unwrap(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn test_close_drains_then_fails() {
        let chan = BoundedChannel::unbounded();
        chan.put(1).unwrap();
        chan.close();
        assert!(!chan.is_open());
        assert_eq!(chan.take().unwrap(), 1);
        assert_eq!(chan.take(), Err(ReferenceError::ChannelClosed));
        assert_eq!(chan.put(2), Err(ReferenceError::ChannelClosed));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let chan = Arc::new(BoundedChannel::<i32>::unbounded());
        let chan2 = chan.clone();
        let consumer = thread::spawn(move || chan2.take());
        thread::sleep(Duration::from_millis(50));
        chan.close();
        assert_eq!(consumer.join().unwrap(), Err(ReferenceError::ChannelClosed));
    }

    #[test]
    fn test_close_wakes_blocked_rendezvous_producer() {
        let chan = Arc::new(BoundedChannel::bounded(0));
        let chan2 = chan.clone();
        let producer = thread::spawn(move || chan2.put(7));
        thread::sleep(Duration::from_millis(50));
        chan.close();
        assert_eq!(producer.join().unwrap(), Err(ReferenceError::ChannelClosed));
    }
}
