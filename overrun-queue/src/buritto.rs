//! BuRiTTO (Buffer Ring To Trustily Overrun): an overrunning SPSC queue
//! with total accounting.
//!
//! The producer is never blocked and never fails. Pushing onto a full ring
//! displaces the oldest unread value and hands it back to the caller, so
//! every pushed value has exactly one fate: popped by the consumer, or
//! returned to the producer as an overrun.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Shared:                                                     │
//! │   write: CachePadded<AtomicU64>   ← producer publishes      │
//! │   read:  CachePadded<AtomicU64>   ← consumer publishes      │
//! │   pending: AtomicU8               ← record up for exchange  │
//! │   records: [Transaction; 3]                                 │
//! │   buffer: [T; N]                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Coordination runs over a pool of three records: one owned by the
//! producer, one owned by the consumer, and one reachable through the shared
//! `pending` index. Ownership moves only through an atomic swap of that
//! index, so an eviction in flight on the producer side and a pop in flight
//! on the consumer side can hand off without either side waiting. The
//! counters are 64-bit and never wrap in practice (585 years at one push per
//! nanosecond).
//!
//! # Example
//!
//! ```
//! use overrun_queue::buritto::Buritto;
//!
//! let (mut tx, mut rx) = Buritto::<u64, 4>::new();
//!
//! for i in 0..4 {
//!     assert!(tx.push(i).is_none());
//! }
//! // One extra value parks in the in-flight exchange record.
//! assert!(tx.push(4).is_none());
//! // After that, each push hands the oldest value back.
//! assert_eq!(tx.push(5), Some(0));
//!
//! // The consumer still sees everything that was not handed back, in order.
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

use crate::index::slot_index;

/// Which endpoint last wrote a record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Source {
    Pop,
    Push,
}

/// A coordination record.
///
/// At every instant exactly one record is producer-owned, one is
/// consumer-owned and one is reachable through `pending`; the partition is a
/// permutation of the three pool slots and only the `pending` swap moves a
/// record between roles.
struct Transaction<T> {
    value: MaybeUninit<T>,
    counter: u64,
    source: Source,
}

impl<T> Transaction<T> {
    fn idle() -> Self {
        Transaction {
            value: MaybeUninit::uninit(),
            counter: 0,
            source: Source::Pop,
        }
    }
}

/// The shared core of the queue. Constructed once via [`Buritto::new`],
/// which issues the two endpoints.
#[repr(C)]
pub struct Buritto<T, const N: usize> {
    /// Producer publish counter; the slot for counter `c` is `c mod N`.
    write: CachePadded<AtomicU64>,
    /// Consumer read counter.
    read: CachePadded<AtomicU64>,
    /// Pool index (0..3) of the record currently up for exchange.
    pending: AtomicU8,
    records: [UnsafeCell<Transaction<T>>; 3],
    buffer: [UnsafeCell<MaybeUninit<T>>; N],
}

// Safety: the ring is coordinated through the atomics above; each record and
// buffer slot is only touched by the endpoint that owns it under the
// exchange protocol.
unsafe impl<T: Send, const N: usize> Send for Buritto<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Buritto<T, N> {}

impl<T: Copy, const N: usize> Buritto<T, N> {
    const _ASSERT_CAPACITY: () = assert!(N > 0, "capacity must be non-zero");

    /// Creates the queue and returns its two endpoints.
    ///
    /// Each endpoint is issued exactly once; the single-producer
    /// single-consumer contract is enforced by construction.
    pub fn new() -> (Producer<T, N>, Consumer<T, N>) {
        let _ = Self::_ASSERT_CAPACITY;

        let queue = Arc::new(Buritto {
            write: CachePadded::new(AtomicU64::new(0)),
            read: CachePadded::new(AtomicU64::new(0)),
            // producer starts on record 1, consumer on record 0
            pending: AtomicU8::new(2),
            records: [
                UnsafeCell::new(Transaction::idle()),
                UnsafeCell::new(Transaction::idle()),
                UnsafeCell::new(Transaction::idle()),
            ],
            // Safety: `UnsafeCell<MaybeUninit<T>>` does not require
            // initialization
            buffer: unsafe { MaybeUninit::uninit().assume_init() },
        });

        (
            Producer {
                read: 0,
                record: 1,
                queue: Arc::clone(&queue),
            },
            Consumer { record: 0, queue },
        )
    }
}

impl<T, const N: usize> fmt::Debug for Buritto<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buritto")
            .field("capacity", &N)
            .finish_non_exhaustive()
    }
}

/// The producer endpoint.
///
/// Takes `&mut self` on [`push`](Producer::push) to statically ensure
/// single-producer access.
pub struct Producer<T, const N: usize> {
    /// Producer-private shadow of the highest read position it has observed
    /// or enacted.
    read: u64,
    /// Pool index of the record this endpoint currently owns.
    record: u8,
    queue: Arc<Buritto<T, N>>,
}

impl<T: Copy, const N: usize> Producer<T, N> {
    /// Pushes a value, handing back the oldest buffered value if the ring
    /// is full.
    ///
    /// Returns `None` when the value was absorbed without displacing
    /// anything, and `Some(oldest)` when the push overran the consumer.
    /// Wait-free: a bounded number of steps, no retries.
    ///
    /// # Example
    ///
    /// ```
    /// use overrun_queue::buritto::Buritto;
    ///
    /// let (mut tx, _rx) = Buritto::<u32, 2>::new();
    ///
    /// assert_eq!(tx.push(1), None);
    /// assert_eq!(tx.push(2), None);
    /// assert_eq!(tx.push(3), None); // parked in the exchange record
    /// assert_eq!(tx.push(4), Some(1));
    /// ```
    #[inline]
    pub fn push(&mut self, value: T) -> Option<T> {
        let write = self.queue.write.load(Ordering::Relaxed);

        let evicted = if write - self.read >= N as u64 {
            self.reclaim_oldest(write)
        } else {
            None
        };

        let queue = &*self.queue;
        unsafe { (*queue.buffer[slot_index::<N>(write)].get()).write(value) };
        queue.write.store(write + 1, Ordering::Release);

        evicted
    }

    /// Full-ring path: move the oldest buffered value into this endpoint's
    /// record and offer it through `pending`. The record received in
    /// exchange tells us how far the consumer has progressed in the
    /// meantime.
    #[cold]
    fn reclaim_oldest(&mut self, write: u64) -> Option<T> {
        debug_assert!(write - self.read >= N as u64);
        let queue = &*self.queue;
        let read = self.read;

        // Safety: this endpoint owns `records[self.record]` exclusively
        // until the swap below publishes it. The buffer slot being copied
        // holds an initialized value (its position is below `write`) and
        // only this thread writes the buffer.
        let previous = unsafe {
            let record = queue.records[self.record as usize].get();
            let previous = (*record).counter;
            (*record).source = Source::Push;
            (*record).value = *queue.buffer[slot_index::<N>(read)].get();
            (*record).counter = read + 1;
            previous
        };

        self.record = queue.pending.swap(self.record, Ordering::AcqRel);

        // Safety: the swap transferred ownership of the received record to
        // this endpoint.
        let record = queue.records[self.record as usize].get();
        let (counter, source) = unsafe { ((*record).counter, (*record).source) };

        if source == Source::Push && counter > previous {
            // The consumer never claimed the eviction offered earlier; it
            // comes back and is reported to the caller as the overrun.
            self.read = read + 1;
            // Safety: push records always carry an initialized value.
            return Some(unsafe { (*record).value.assume_init_read() });
        }

        // The consumer has progressed; adopt its position if it is ahead of
        // the slot that was about to be reclaimed.
        self.read = if counter > read + 1 { counter } else { read + 1 };
        None
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of push positions the consumer has not yet settled (snapshot;
    /// may be stale).
    ///
    /// This counts values buffered in the ring and a value parked in an
    /// unclaimed overrun record; after an overrun it can briefly also count
    /// positions whose values were already handed back, until the consumer
    /// crosses them.
    #[inline]
    pub fn len(&self) -> usize {
        let read = self.queue.read.load(Ordering::Relaxed);
        let write = self.queue.write.load(Ordering::Relaxed);
        (write - read) as usize
    }

    /// Returns `true` if the consumer currently has nothing to pop.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.read.load(Ordering::Relaxed) == self.queue.write.load(Ordering::Relaxed)
    }

    /// Returns `true` if the consumer endpoint has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.queue) == 1
    }
}

impl<T, const N: usize> fmt::Debug for Producer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &N)
            .finish_non_exhaustive()
    }
}

/// The consumer endpoint.
///
/// Takes `&mut self` on [`pop`](Consumer::pop) to statically ensure
/// single-consumer access.
pub struct Consumer<T, const N: usize> {
    /// Pool index of the record this endpoint currently owns.
    record: u8,
    queue: Arc<Buritto<T, N>>,
}

impl<T: Copy, const N: usize> Consumer<T, N> {
    /// Removes and returns the oldest reachable value, or `None` if the
    /// queue is empty.
    ///
    /// When a pop races with an overrunning producer, the value it would
    /// have read from the ring may already be displaced; the exchange record
    /// received from `pending` then carries the authoritative value and read
    /// position.
    ///
    /// # Example
    ///
    /// ```
    /// use overrun_queue::buritto::Buritto;
    ///
    /// let (mut tx, mut rx) = Buritto::<u32, 8>::new();
    ///
    /// assert_eq!(rx.pop(), None);
    /// tx.push(7);
    /// assert_eq!(rx.pop(), Some(7));
    /// ```
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let queue = &*self.queue;
        let read = queue.read.load(Ordering::Relaxed);
        let write = queue.write.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        // Candidate copy from the ring. The producer may be overwriting this
        // slot concurrently during an overrun; the copy stays unasserted
        // until the record exchange below proves it was stable.
        let candidate = unsafe { *queue.buffer[slot_index::<N>(read)].get() };

        // Safety: this endpoint owns `records[self.record]` exclusively
        // until the swap below publishes it.
        unsafe {
            let record = queue.records[self.record as usize].get();
            (*record).source = Source::Pop;
            (*record).counter = read + 1;
        }

        self.record = queue.pending.swap(self.record, Ordering::AcqRel);

        // Safety: the swap transferred ownership of the received record to
        // this endpoint.
        let record = queue.records[self.record as usize].get();
        let counter = unsafe { (*record).counter };

        // `>=` rather than `>`: the producer may already have overwritten
        // the ring slot the candidate was copied from.
        let (value, next_read) = if counter >= read + 1 {
            // Safety: a record that is ahead of this endpoint is an eviction
            // record, and eviction records carry an initialized value.
            (unsafe { (*record).value.assume_init_read() }, counter)
        } else {
            // Safety: no eviction touched this position, so the candidate is
            // a stable copy of the value pushed for it.
            (unsafe { candidate.assume_init() }, read + 1)
        };

        queue.read.store(next_read, Ordering::Relaxed);
        Some(value)
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of push positions this endpoint has not yet settled (snapshot;
    /// may be stale). See [`Producer::len`].
    #[inline]
    pub fn len(&self) -> usize {
        let read = self.queue.read.load(Ordering::Relaxed);
        let write = self.queue.write.load(Ordering::Relaxed);
        (write - read) as usize
    }

    /// Returns `true` if there is currently nothing to pop.
    ///
    /// The read counter can only fall behind reality through this endpoint's
    /// own pops, so the check cannot spuriously report a non-empty queue as
    /// empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.read.load(Ordering::Relaxed) == self.queue.write.load(Ordering::Relaxed)
    }

    /// Returns `true` if the producer endpoint has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.queue) == 1
    }
}

impl<T, const N: usize> fmt::Debug for Consumer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &N)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod proptests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;

    #[derive(Clone, Debug)]
    enum Op {
        Push(u64),
        Pop,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u64>().prop_map(Op::Push), Just(Op::Pop)]
    }

    proptest! {
        /// Single-threaded, the queue behaves like a FIFO that holds at most
        /// `capacity + 1` values (ring plus the exchange record) and hands
        /// the front back once that bound is exceeded.
        #[test]
        fn matches_bounded_deque_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            const CAPACITY: usize = 4;
            let (mut tx, mut rx) = Buritto::<u64, CAPACITY>::new();
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(v) => {
                        let evicted = tx.push(v);
                        model.push_back(v);
                        let expected = if model.len() > CAPACITY + 1 {
                            model.pop_front()
                        } else {
                            None
                        };
                        prop_assert_eq!(evicted, expected);
                    }
                    Op::Pop => {
                        prop_assert_eq!(rx.pop(), model.pop_front());
                    }
                }
                prop_assert_eq!(rx.is_empty(), model.is_empty());
            }

            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(rx.pop(), Some(expected));
            }
            prop_assert_eq!(rx.pop(), None);
        }

        /// Without overruns, pops replay pushes exactly.
        #[test]
        fn roundtrip_without_overrun(values in proptest::collection::vec(any::<u64>(), 0..8)) {
            let (mut tx, mut rx) = Buritto::<u64, 8>::new();

            for &v in &values {
                prop_assert_eq!(tx.push(v), None);
            }
            for &v in &values {
                prop_assert_eq!(rx.pop(), Some(v));
            }
            prop_assert_eq!(rx.pop(), None);
        }
    }
}
