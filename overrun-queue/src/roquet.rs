//! RoQueT (Robust Queue Transfer): an overrunning SPSC queue whose entire
//! coordination state lives in a ring of per-slot tag bytes.
//!
//! Unlike [`buritto`](crate::buritto), which coordinates through monotonic
//! counters, every slot here carries its own 8-bit tag. The queue state is
//! therefore recoverable by inspecting the tag ring alone, which makes the
//! layout a candidate building block for zero-copy transports where either
//! endpoint may crash and be restarted. Crash recovery itself is not
//! implemented; this queue provides the state layout that would enable it.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ tags:  [AtomicU8; capacity + 2]   ← all coordination state   │
//! │ data:  [T; capacity + 2]          ← payloads, producer-write │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one slot carries the `END` tag: the hole the producer will claim
//! next, separating the consumer side of the ring from the producer side.
//! A push moves the hole forward by one slot, evicting that slot's payload
//! if the consumer never harvested it. A pop raises `INSPECTED` on the slot
//! it is about to harvest so that a full producer wrap-around cannot go
//! unnoticed, then claims the payload by swinging the tag to `EMPTY`.
//!
//! The two rings are separate allocations: the payload ring could be mapped
//! where the consumer has no write access.
//!
//! # Example
//!
//! ```
//! use overrun_queue::roquet;
//!
//! let (mut tx, mut rx) = roquet::ring_buffer::<u64>(4);
//!
//! assert_eq!(tx.push(1).unwrap(), None);
//! assert_eq!(rx.pop().unwrap(), Some(1));
//! assert!(rx.is_empty());
//! ```

use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Scan steps a single pop may take before the queue is declared corrupt.
///
/// A pop racing an overrunning producer walks forward to find the relocated
/// hole; a healthy queue resolves that in a handful of steps.
const POP_ATTEMPTS: usize = 10_000;

/// Per-slot coordination tag.
///
/// Tags are bit flags and several may be set at once (`END | OVERFLOW`
/// marks a hole that displaced unread data, `DATA | INSPECTED` marks a
/// payload the consumer is about to harvest).
#[derive(Clone, Copy, PartialEq, Eq)]
struct Tag(u8);

impl Tag {
    /// Slot holds no live payload.
    const EMPTY: Tag = Tag(0x01);
    /// Reserved for transactional pushes; emptiness checks treat it like
    /// `END`, nothing else special-cases it.
    const PENDING: Tag = Tag(0x02);
    /// Slot holds a value the consumer has not yet harvested.
    const DATA: Tag = Tag(0x04);
    /// The hole displaced unread data when it moved onto this slot.
    const OVERFLOW: Tag = Tag(0x08);
    /// Raised by the consumer so a producer wrap-around cannot reproduce a
    /// tag value the consumer has already acted on.
    const INSPECTED: Tag = Tag(0x10);
    /// The hole: the next slot the producer will claim.
    const END: Tag = Tag(0x80);

    #[inline]
    const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    const fn from_bits(bits: u8) -> Tag {
        Tag(bits)
    }

    #[inline]
    const fn intersects(self, other: Tag) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    const fn with(self, other: Tag) -> Tag {
        Tag(self.0 | other.0)
    }

    #[inline]
    const fn without(self, other: Tag) -> Tag {
        Tag(self.0 & !other.0)
    }
}

impl BitOr for Tag {
    type Output = Tag;

    fn bitor(self, rhs: Tag) -> Tag {
        self.with(rhs)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Tag, &str); 6] = [
            (Tag::EMPTY, "EMPTY"),
            (Tag::PENDING, "PENDING"),
            (Tag::DATA, "DATA"),
            (Tag::OVERFLOW, "OVERFLOW"),
            (Tag::INSPECTED, "INSPECTED"),
            (Tag::END, "END"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.intersects(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

/// Shared storage: the tag ring and the payload ring, as separate
/// allocations.
struct Shared<T> {
    tags: *mut AtomicU8,
    data: *mut MaybeUninit<T>,
    /// Total slot count: capacity + 2 (the hole plus the consumer anchor).
    slots: usize,
}

// Safety: payload slots are only written by the producer and only read once
// a tag transition published them; the tag ring is atomic.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn tag(&self, position: usize) -> &AtomicU8 {
        debug_assert!(position < self.slots);
        // Safety: `position` is always reduced modulo `slots` before use.
        unsafe { &*self.tags.add(position) }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // payloads are plain copies; only the two allocations need releasing
        unsafe {
            drop(Vec::from_raw_parts(self.tags, self.slots, self.slots));
            drop(Vec::from_raw_parts(self.data, 0, self.slots));
        }
    }
}

/// Creates a queue with the given capacity and returns its two endpoints.
///
/// Two internal slots beyond `capacity` hold the hole (`END`) and the
/// consumer anchor, so the queue absorbs `capacity + 1` values before the
/// first eviction.
///
/// Each endpoint is issued exactly once; the single-producer
/// single-consumer contract is enforced by construction.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn ring_buffer<T: Copy>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "capacity must be non-zero");

    let slots = capacity + 2;

    let mut tags = ManuallyDrop::new(Vec::with_capacity(slots));
    for position in 0..slots {
        let initial = if position == 1 { Tag::END } else { Tag::EMPTY };
        tags.push(AtomicU8::new(initial.bits()));
    }

    let mut data = ManuallyDrop::new(Vec::<MaybeUninit<T>>::with_capacity(slots));

    let shared = Arc::new(Shared {
        tags: tags.as_mut_ptr(),
        data: data.as_mut_ptr(),
        slots,
    });

    (
        Producer {
            tail: 1,
            shared: Arc::clone(&shared),
        },
        Consumer { head: 0, shared },
    )
}

/// The producer endpoint.
///
/// Takes `&mut self` on [`push`](Producer::push) to statically ensure
/// single-producer access.
pub struct Producer<T> {
    /// Slot the next value will be written to; the hole sits just ahead.
    tail: u32,
    shared: Arc<Shared<T>>,
}

impl<T: Copy> Producer<T> {
    /// Appends a value.
    ///
    /// Returns `Ok(None)` normally and `Ok(Some(oldest))` when the push
    /// overran the consumer and displaced the oldest unread value. `Err`
    /// reports a corrupt tag ring; the rejected value is carried back to
    /// the caller and the queue should not be used further.
    ///
    /// # Example
    ///
    /// ```
    /// use overrun_queue::roquet;
    ///
    /// let (mut tx, _rx) = roquet::ring_buffer::<u32>(1);
    ///
    /// assert_eq!(tx.push(1).unwrap(), None);
    /// assert_eq!(tx.push(2).unwrap(), None);
    /// assert_eq!(tx.push(3).unwrap(), Some(1));
    /// ```
    pub fn push(&mut self, value: T) -> Result<Option<T>, Corrupt<T>> {
        let shared = &*self.shared;
        let cur = self.tail as usize;
        let nxt = if cur + 1 == shared.slots { 0 } else { cur + 1 };

        // Claim `nxt` as the new hole. The only concurrent mutation is the
        // consumer raising INSPECTED or harvesting the slot, so every retry
        // re-reads the tag and re-chooses the target.
        let tag_nxt = shared.tag(nxt);
        let mut observed = Tag::DATA;
        let displaced = loop {
            let target = if observed.intersects(Tag::DATA) {
                Tag::END | Tag::OVERFLOW
            } else {
                Tag::END
            };
            match tag_nxt.compare_exchange(
                observed.bits(),
                target.bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break observed.intersects(Tag::DATA),
                Err(bits) => observed = Tag::from_bits(bits),
            }
        };

        // Safety: the claim took the slot away from the consumer, and only
        // this thread writes payloads, so a displaced value is initialized
        // and stable.
        let evicted = if displaced {
            Some(unsafe { (*shared.data.add(nxt)).assume_init() })
        } else {
            None
        };

        if !Tag::from_bits(tag_nxt.load(Ordering::Relaxed)).intersects(Tag::END) {
            // The claim above re-establishes the single hole; anything else
            // means the tag ring no longer obeys the protocol.
            return Err(Corrupt(value));
        }

        // Safety: `cur` is the hole's predecessor and belongs to the
        // producer until the tag store below publishes it.
        unsafe { (*shared.data.add(cur)).write(value) };
        // Publishing DATA also clears a consumer-raised INSPECTED flag.
        shared.tag(cur).store(Tag::DATA.bits(), Ordering::Release);

        self.tail = nxt as u32;
        Ok(evicted)
    }

    /// Best-effort emptiness check from the producer's side.
    ///
    /// The slot behind the hole carries `DATA` exactly while something is
    /// still unharvested.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let shared = &*self.shared;
        let behind = if self.tail == 0 {
            shared.slots - 1
        } else {
            self.tail as usize - 1
        };
        !Tag::from_bits(shared.tag(behind).load(Ordering::Relaxed)).intersects(Tag::DATA)
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.slots - 2
    }

    /// Returns `true` if the consumer endpoint has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &(self.shared.slots - 2))
            .finish_non_exhaustive()
    }
}

/// The consumer endpoint.
///
/// Takes `&mut self` on [`pop`](Consumer::pop) to statically ensure
/// single-consumer access.
pub struct Consumer<T> {
    /// Anchor slot; the next harvest candidate sits just ahead.
    head: u32,
    shared: Arc<Shared<T>>,
}

impl<T: Copy> Consumer<T> {
    /// Removes and returns the oldest value, or `Ok(None)` when the queue
    /// is empty.
    ///
    /// A pop racing an overrunning producer walks forward until it finds
    /// the relocated hole. The walk is bounded by an internal retry budget;
    /// exhausting it reports the queue as corrupt. The budget is generous
    /// enough that a healthy queue never comes close, but the exit cannot
    /// distinguish true corruption from absurd contention.
    pub fn pop(&mut self) -> Result<Option<T>, Corrupt> {
        let shared = &*self.shared;
        let mut cur = self.head as usize;
        let mut nxt = cur + 1;

        for _ in 0..POP_ATTEMPTS {
            if nxt == shared.slots {
                nxt = 0;
            }

            let tag_nxt_cell = shared.tag(nxt);
            let tag_cur_cell = shared.tag(cur);

            let mut tag_nxt = Tag::from_bits(tag_nxt_cell.load(Ordering::Acquire));
            let tag_cur = Tag::from_bits(tag_cur_cell.load(Ordering::Acquire));

            if tag_cur.intersects(Tag::EMPTY) && tag_nxt.intersects(Tag::END | Tag::PENDING) {
                return Ok(None);
            }

            // Raise INSPECTED before touching the payload. The producer
            // clears it when it republishes this slot, so the acceptance
            // CAS below cannot match a tag from a previous lap.
            if !tag_nxt.intersects(Tag::INSPECTED) {
                let raised = tag_nxt.with(Tag::INSPECTED);
                if tag_nxt_cell
                    .compare_exchange(
                        tag_nxt.bits(),
                        raised.bits(),
                        Ordering::Release,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }
                tag_nxt = raised;
            }

            // May race with the producer republishing this slot; the copy
            // stays unasserted until the CAS below proves the tag did not
            // move underneath it.
            let candidate = unsafe { *shared.data.add(nxt) };

            let tag_cur = Tag::from_bits(tag_cur_cell.load(Ordering::SeqCst));

            if tag_cur.intersects(Tag::END) && tag_cur.intersects(Tag::OVERFLOW) {
                // An overrun moved the queue underneath this pop; absorb the
                // marker and rescan from the same position.
                let _ = tag_cur_cell.compare_exchange(
                    tag_cur.bits(),
                    tag_cur.without(Tag::OVERFLOW).bits(),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else if tag_cur.intersects(Tag::EMPTY | Tag::END) && tag_nxt.intersects(Tag::DATA) {
                if tag_nxt_cell
                    .compare_exchange(
                        tag_nxt.bits(),
                        Tag::EMPTY.bits(),
                        Ordering::Release,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.head = nxt as u32;
                    // Safety: the tag carried DATA and did not change between
                    // the copy and the claim, so the candidate is a stable
                    // copy of a published payload.
                    return Ok(Some(unsafe { candidate.assume_init() }));
                }
                // The producer overtook this slot; the hole has moved.
                cur = nxt;
                nxt += 1;
            } else {
                // An overrun relocated the hole; walk forward to find it.
                cur = nxt;
                nxt += 1;
            }
        }

        Err(Corrupt(()))
    }

    /// Best-effort emptiness check from the consumer's side.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let shared = &*self.shared;
        let cur = self.head as usize;
        let nxt = if cur + 1 == shared.slots { 0 } else { cur + 1 };
        let tag_cur = Tag::from_bits(shared.tag(cur).load(Ordering::Relaxed));
        let tag_nxt = Tag::from_bits(shared.tag(nxt).load(Ordering::Relaxed));
        tag_cur.intersects(Tag::EMPTY) && tag_nxt.intersects(Tag::END | Tag::PENDING)
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.slots - 2
    }

    /// Returns `true` if the producer endpoint has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &(self.shared.slots - 2))
            .finish_non_exhaustive()
    }
}

/// Error returned when the tag ring no longer obeys the coordination
/// protocol.
///
/// For [`Producer::push`] the error carries the value that was not
/// enqueued, returning ownership to the caller. Corruption is terminal for
/// the queue instance: there is no recovery path, callers should drop both
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corrupt<T = ()>(pub T);

impl<T> Corrupt<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Corrupt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue tag ring is corrupt")
    }
}

impl<T: fmt::Debug> std::error::Error for Corrupt<T> {}

// TODO: transactional pushes will claim PENDING ahead of moving END; the
// emptiness checks already treat PENDING like END so they stay valid when
// that lands.


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
        /// `capacity + 1` values and evicts the front past that bound.
        #[test]
        fn matches_bounded_deque_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            const CAPACITY: usize = 4;
            let (mut tx, mut rx) = ring_buffer::<u64>(CAPACITY);
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(v) => {
                        let evicted = tx.push(v).unwrap();
                        model.push_back(v);
                        let expected = if model.len() > CAPACITY + 1 {
                            model.pop_front()
                        } else {
                            None
                        };
                        prop_assert_eq!(evicted, expected);
                    }
                    Op::Pop => {
                        prop_assert_eq!(rx.pop().unwrap(), model.pop_front());
                    }
                }
                prop_assert_eq!(rx.is_empty(), model.is_empty());
                prop_assert_eq!(tx.is_empty(), model.is_empty());
            }

            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(rx.pop().unwrap(), Some(expected));
            }
            prop_assert_eq!(rx.pop().unwrap(), None);
        }

        /// Without evictions, pops replay pushes exactly.
        #[test]
        fn roundtrip_without_eviction(values in proptest::collection::vec(any::<u64>(), 0..8)) {
            let (mut tx, mut rx) = ring_buffer::<u64>(8);

            for &v in &values {
                prop_assert_eq!(tx.push(v).unwrap(), None);
            }
            for &v in &values {
                prop_assert_eq!(rx.pop().unwrap(), Some(v));
            }
            prop_assert_eq!(rx.pop().unwrap(), None);
        }
    }
}
