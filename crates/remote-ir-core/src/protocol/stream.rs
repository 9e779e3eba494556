//! Blocking byte stream
//!
//! Adapts the transport's push-style chunk delivery into a pull-style byte
//! source. The queue is bounded: a producer that outruns the reader blocks
//! until space frees up.
//!
//! Besides bytes the queue can carry marks. A mark holds its place between
//! the bytes queued before and after it, which lets events raised next to the
//! data (signals, listener changes) reach the reader in the same order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// Default number of bytes buffered between the transport and the line reader
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Item taken from a [`ByteChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A data byte
    Byte(u8),
    /// A mark queued with [`ByteChannel::mark`]
    Mark,
}

struct ChannelState {
    queue: VecDeque<Received>,
    /// Data bytes in `queue`; marks do not count against the capacity
    bytes: usize,
    open: bool,
}

/// Bounded single-producer / single-consumer byte queue
///
/// Once closed a channel stays closed; reconnecting requires a new channel.
pub struct ByteChannel {
    state: Mutex<ChannelState>,
    /// Signalled when a byte or mark is queued or the channel closes
    readable: Condvar,
    /// Signalled when a byte is taken or the channel closes
    writable: Condvar,
    capacity: usize,
}

impl ByteChannel {
    /// Create an open channel holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::with_capacity(capacity),
                bytes: 0,
                open: true,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue every byte of `bytes`, blocking while the channel is full.
    ///
    /// If the channel is closed while waiting for space, the rest of the
    /// chunk is dropped. Returns how many bytes were accepted.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut state = self.lock();

        for (accepted, &byte) in bytes.iter().enumerate() {
            while state.open && state.bytes >= self.capacity {
                state = self
                    .writable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            if !state.open {
                warn!(
                    dropped = bytes.len() - accepted,
                    "Byte channel closed, dropping rest of chunk"
                );
                return accepted;
            }

            state.queue.push_back(Received::Byte(byte));
            state.bytes += 1;
            self.readable.notify_one();
        }

        bytes.len()
    }

    /// Queue a mark behind every byte accepted so far.
    ///
    /// Never blocks. Returns `false` if the channel is closed.
    pub fn mark(&self) -> bool {
        let mut state = self.lock();
        if !state.open {
            return false;
        }
        state.queue.push_back(Received::Mark);
        self.readable.notify_one();
        true
    }

    /// Take the next byte or mark, blocking until one arrives.
    ///
    /// Items queued before [`close`](Self::close) are still returned; after
    /// that every call yields `None`.
    pub fn next(&self) -> Option<Received> {
        let mut state = self.lock();

        loop {
            if let Some(item) = state.queue.pop_front() {
                if let Received::Byte(_) = item {
                    state.bytes -= 1;
                    self.writable.notify_one();
                }
                return Some(item);
            }
            if !state.open {
                return None;
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the next byte, blocking until one arrives. Marks are skipped.
    ///
    /// Bytes queued before [`close`](Self::close) are still returned; after
    /// that every call yields `None`.
    pub fn read(&self) -> Option<u8> {
        loop {
            match self.next()? {
                Received::Byte(byte) => return Some(byte),
                Received::Mark => continue,
            }
        }
    }

    /// Close the channel and wake every blocked reader and producer.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        drop(state);

        debug!("Byte channel closed");
        self.readable.notify_all();
        self.writable.notify_all();
        true
    }

    /// Whether the channel still accepts bytes
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of bytes waiting to be read
    pub fn len(&self) -> usize {
        self.lock().bytes
    }

    /// Whether no bytes are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ByteChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let channel = ByteChannel::new(16);
        assert_eq!(channel.push(b"abc"), 3);
        assert_eq!(channel.push(b"de"), 2);

        let read: Vec<u8> = (0..5).filter_map(|_| channel.read()).collect();
        assert_eq!(read, b"abcde".to_vec());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_full_channel_blocks_producer() {
        let channel = Arc::new(ByteChannel::new(4));
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let channel = channel.clone();
            let done = done.clone();
            thread::spawn(move || {
                let accepted = channel.push(b"12345");
                done.store(true, Ordering::SeqCst);
                accepted
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(channel.len(), 4);
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(channel.read(), Some(b'1'));
        assert_eq!(producer.join().unwrap(), 5);
        assert!(done.load(Ordering::SeqCst));

        let rest: Vec<u8> = (0..4).filter_map(|_| channel.read()).collect();
        assert_eq!(rest, b"2345".to_vec());
    }

    #[test]
    fn test_close_unblocks_pending_read() {
        let channel = Arc::new(ByteChannel::new(4));

        let reader = {
            let channel = channel.clone();
            thread::spawn(move || channel.read())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(channel.close());
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let channel = ByteChannel::new(4);
        channel.push(b"ok");
        channel.close();

        assert_eq!(channel.read(), Some(b'o'));
        assert_eq!(channel.read(), Some(b'k'));
        assert_eq!(channel.read(), None);
        assert_eq!(channel.read(), None);
    }

    #[test]
    fn test_second_close_is_noop() {
        let channel = ByteChannel::new(4);
        assert!(channel.close());
        assert!(!channel.close());
        assert!(!channel.is_open());
    }

    #[test]
    fn test_close_drops_blocked_bytes() {
        let channel = Arc::new(ByteChannel::new(2));

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.push(b"abcde"))
        };

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_eq!(producer.join().unwrap(), 2);
        assert_eq!(channel.push(b"z"), 0);
    }

    #[test]
    fn test_marks_keep_their_position() {
        let channel = ByteChannel::new(2);
        channel.push(b"a");
        assert!(channel.mark());
        channel.push(b"b");

        assert_eq!(channel.next(), Some(Received::Byte(b'a')));
        assert_eq!(channel.next(), Some(Received::Mark));
        assert_eq!(channel.next(), Some(Received::Byte(b'b')));
    }

    #[test]
    fn test_marks_ignore_capacity() {
        let channel = ByteChannel::new(1);
        channel.push(b"x");
        assert!(channel.mark());
        assert!(channel.mark());
        assert_eq!(channel.len(), 1);

        // read() skips marks
        assert_eq!(channel.read(), Some(b'x'));
        channel.close();
        assert_eq!(channel.read(), None);
        assert!(!channel.mark());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let channel = ByteChannel::new(0);
        assert_eq!(channel.capacity(), 1);
        assert_eq!(ByteChannel::default().capacity(), DEFAULT_CHANNEL_CAPACITY);
    }
}
