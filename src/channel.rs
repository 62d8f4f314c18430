//! Thread-safe item streams connecting tasks.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// Creates an unbounded stream of items, returning the paired write-end and
/// read-end.
///
/// The stream is an ordered FIFO intended for one writer and one reader,
/// which may live on different threads. Writing appends an item, reading
/// removes items from the front. Closing the write-end (explicitly or by
/// dropping it) wakes any blocked reader; items buffered at close time can
/// still be read.
pub fn channel<T>() -> (WriteEnd<T>, ReadEnd<T>) {
    let shared = Arc::new(ChannelShared {
        state: Mutex::new(ChannelState {
            items: VecDeque::new(),
            closed: false,
        }),
        readable: Condvar::new(),
    });
    (
        WriteEnd {
            shared: Arc::clone(&shared),
        },
        ReadEnd { shared },
    )
}

/// The producing end of a stream created with [`channel`].
#[derive(Debug)]
pub struct WriteEnd<T> {
    shared: Arc<ChannelShared<T>>,
}

/// The consuming end of a stream created with [`channel`].
#[derive(Debug)]
pub struct ReadEnd<T> {
    shared: Arc<ChannelShared<T>>,
}

/// The error returned when writing to a closed stream. The item is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteError;

#[derive(Debug)]
struct ChannelShared<T> {
    state: Mutex<ChannelState<T>>,
    readable: Condvar,
}

#[derive(Debug)]
struct ChannelState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> WriteEnd<T> {
    /// Appends the given item to the stream.
    ///
    /// # Errors
    /// Returns an error if the stream has been closed.
    pub fn write(&self, item: T) -> Result<(), WriteError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(WriteError);
        }
        state.items.push_back(item);
        // Readers waiting for a specific count re-check it on each wakeup
        self.shared.readable.notify_all();
        Ok(())
    }

    /// Closes the stream, waking all blocked readers. Buffered items remain
    /// readable. Closing an already closed stream has no effect.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.readable.notify_all();
    }

    /// Whether the stream has been closed.
    pub fn closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The number of items currently buffered in the stream.
    pub fn size(&self) -> usize {
        self.shared.state.lock().items.len()
    }
}

impl<T> Drop for WriteEnd<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> ReadEnd<T> {
    /// Removes and returns up to `count` items from the front of the stream,
    /// or all buffered items if `count` is zero.
    ///
    /// With `block` set, the call waits until `count` items are buffered
    /// (for a zero `count`: until the stream is closed), the stream is
    /// closed, or the timeout elapses, whichever comes first. It then
    /// returns the items available at that point, which may be fewer than
    /// demanded and may be none.
    pub fn read(&self, count: usize, block: bool, timeout: Option<Duration>) -> Vec<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        if block {
            loop {
                let satisfied = if count == 0 {
                    state.closed
                } else {
                    state.items.len() >= count || state.closed
                };
                if satisfied {
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .readable
                            .wait_until(&mut state, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    None => self.shared.readable.wait(&mut state),
                }
            }
        }
        let n_items = if count == 0 {
            state.items.len()
        } else {
            count.min(state.items.len())
        };
        state.items.drain(..n_items).collect()
    }

    /// The number of items currently buffered in the stream.
    pub fn size(&self) -> usize {
        self.shared.state.lock().items.len()
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream is closed")
    }
}

impl std::error::Error for WriteError {}
