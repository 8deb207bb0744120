//! Lossless wait-free SPSC queues for telemetry paths.
//!
//! `overrun-queue` provides bounded single-producer single-consumer queues
//! for paths where the producer must never be blocked by a slow or absent
//! consumer. When a queue is full, a push displaces the oldest unread value
//! and hands it back to the producer, so nothing is ever silently dropped:
//! every pushed value is either popped by the consumer or returned to the
//! producer, exactly once.
//!
//! # Quick Start
//!
//! ```
//! use overrun_queue::buritto::Buritto;
//!
//! let (mut tx, mut rx) = Buritto::<u64, 4>::new();
//!
//! for i in 0..4 {
//!     assert!(tx.push(i).is_none());
//! }
//! // One more value fits in the in-flight exchange record.
//! assert!(tx.push(4).is_none());
//! // Now the oldest value comes back to the producer instead of being lost.
//! assert_eq!(tx.push(5), Some(0));
//!
//! assert_eq!(rx.pop(), Some(1));
//! ```
//!
//! # Implementations
//!
//! Two queues with the same overrun contract but different coordination
//! schemes:
//!
//! - [`buritto`]: monotonic 64-bit counters plus a pool of three exchange
//!   records. The producer is wait-free, the consumer completes every pop in
//!   a single linear pass. Compile-time capacity, embedded storage.
//! - [`roquet`]: all coordination state lives in a ring of per-slot tag
//!   bytes, so the queue state can be reconstructed by inspecting the ring
//!   alone. This is the building block for transports where either endpoint
//!   may crash and be restarted; run-time capacity.
//!
//! Both queues require `T: Copy` — values move by bitwise copy and the hot
//! paths never run drop glue.
//!
//! # Progress guarantees
//!
//! Neither side ever waits on the other. Pushes complete in a bounded number
//! of steps. [`buritto`] pops are wait-free as well; [`roquet`] pops are
//! lock-free and may walk forward while racing an overrunning producer, with
//! a bounded retry budget as a safety net.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod buritto;
mod index;
pub mod roquet;
