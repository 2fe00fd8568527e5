//! lapq - bounded lock-free MPMC queue over a lap-counted ring
//!
//! - `try_send` / `try_recv` / `try_peek` : non-blocking operations; one CAS
//!   on the uncontended path, lock-free under contention
//! - any number of producers and consumers; elements from distinct producers
//!   may interleave, each producer's own elements stay in order
//! - `close` stops producers while consumers keep draining
//! - capacity is fixed at construction and at most [`MAX_CAPACITY`]
//!
//! The library is `no_std` + `alloc`, suitable for multicore microcontrollers
//! as well as hosted targets.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// Largest capacity a queue can be built with.
///
/// Cursor words pack the ring position into their low 16 bits and the lap
/// into the high bits; the top bit of the send word is the closed flag, so
/// positions and laps both live in 15-bit space.
pub const MAX_CAPACITY: u16 = (1 << 15) - 1;

/// Low half of a cursor word: the ring position.
const POS_MASK: u32 = 0xFFFF;
const LAP_SHIFT: u32 = 16;
/// Laps wrap modulo 2^15; bit 15 of the send lap is the closed flag.
const LAP_MASK: u16 = 0x7FFF;
/// Closed flag, bit 31 of the send cursor word.
const CLOSED: u32 = 1 << 31;

/// One ring slot. The lap counter is the slot's entire state machine: the
/// value is writable while the lap is even and readable while it is odd.
struct Slot<T> {
    lap: AtomicU16,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Error returned by [`Queue::try_send`], handing the rejected value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    /// Every slot still holds an element the consumers have not drained.
    #[error("queue is full")]
    Full(T),
    /// The queue was closed; no further elements are accepted.
    #[error("queue is closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that could not be inserted.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed(value) => value,
        }
    }
}

/// Error returned by [`Queue::try_send_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrySendRefError {
    /// Every slot still holds an element the consumers have not drained.
    #[error("queue is full")]
    Full,
    /// The queue was closed; no further elements are accepted.
    #[error("queue is closed")]
    Closed,
}

/// Error returned by [`Queue::try_recv`]: nothing is ready at the current
/// recv position.
///
/// Consumers never observe the closed flag at this layer; combine
/// [`Queue::is_closed`] with a failing `try_recv` to build a termination
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is empty")]
pub struct TryRecvError;

/// Internal verdict of the producer-side claim loop.
enum Reject {
    Full,
    Closed,
}

/// Signed distance from lap `b` to lap `a` in the 15-bit lap ring.
///
/// Zero when equal, positive when `a` is ahead of `b`, negative when `a` is
/// behind. Computing the distance modulo 2^15 first keeps the sign correct
/// across lap wraparound.
#[inline]
fn lap_delta(a: u16, b: u16) -> i16 {
    ((a.wrapping_sub(b) & LAP_MASK) << 1) as i16
}

/// The lap value that publishes the next state of a slot.
#[inline]
fn next_lap(lap: u16) -> u16 {
    lap.wrapping_add(1) & LAP_MASK
}

/// Bounded lock-free MPMC queue.
///
/// Producers and consumers each advance their own packed cursor word over
/// the ring; a side may claim the slot its cursor addresses only while the
/// slot's lap matches the cursor's lap. Claiming is a single
/// compare-exchange on the cursor, after which the claimant owns the slot
/// until it publishes the next lap with a release store. The two cursors
/// live on separate cache lines so the producer and consumer fast paths do
/// not false-share.
pub struct Queue<T> {
    /// Producer cursor; bit 31 is the closed flag.
    send: CachePadded<AtomicU32>,
    /// Consumer cursor; starts one lap ahead of `send`.
    recv: CachePadded<AtomicU32>,
    buf: Box<[Slot<T>]>,
    /// Advisory element count, maintained after lap publication.
    len: AtomicI32,
    cap: u16,
}

impl<T> Queue<T> {
    /// Creates a queue with `cap` slots.
    ///
    /// # Panics
    ///
    /// Panics if `cap` is zero or exceeds [`MAX_CAPACITY`].
    pub fn new(cap: u16) -> Self {
        assert!(cap > 0, "capacity must be > 0");
        assert!(
            cap <= MAX_CAPACITY,
            "capacity must be <= {}",
            MAX_CAPACITY
        );

        let mut buf = Vec::with_capacity(cap as usize);
        for _ in 0..cap {
            buf.push(Slot {
                lap: AtomicU16::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        Queue {
            send: CachePadded::new(AtomicU32::new(0)),
            recv: CachePadded::new(AtomicU32::new(1 << LAP_SHIFT)),
            buf: buf.into_boxed_slice(),
            len: AtomicI32::new(0),
            cap,
        }
    }

    /// The cursor word that follows `x` once the slot at `pos` is claimed.
    ///
    /// Within a lap the word just increments; at the end of the ring the
    /// position resets and the lap advances by 2, preserving this side's
    /// parity.
    #[inline]
    fn next_cursor(&self, x: u32, pos: u32, lap: u16) -> u32 {
        if pos + 1 < self.cap as u32 {
            x + 1
        } else {
            ((lap.wrapping_add(2) & LAP_MASK) as u32) << LAP_SHIFT
        }
    }

    /// Claims the slot the send cursor addresses for writing.
    ///
    /// On success the caller owns the slot exclusively until it publishes
    /// the next lap; the returned pair is the slot index and the lap that
    /// was observed on it.
    fn claim_write(&self) -> Result<(usize, u16), Reject> {
        loop {
            let x = self.send.load(Ordering::Acquire);
            if x & CLOSED != 0 {
                return Err(Reject::Closed);
            }
            let pos = x & POS_MASK;
            let lap = (x >> LAP_SHIFT) as u16;
            let slot = &self.buf[pos as usize];
            let elap = slot.lap.load(Ordering::Acquire);

            let delta = lap_delta(lap, elap);
            if delta == 0 {
                // The slot is writable on this lap. Race the other producers
                // for it by advancing the cursor past it.
                let next = self.next_cursor(x, pos, lap);
                if self
                    .send
                    .compare_exchange_weak(x, next, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok((pos as usize, elap));
                }
            } else if delta > 0 {
                // The slot still holds the previous lap's element. Re-read
                // its lap once: a consumer may have drained it between the
                // two loads above, in which case our cursor value was merely
                // stale.
                if lap_delta(lap, slot.lap.load(Ordering::Acquire)) > 0 {
                    return Err(Reject::Full);
                }
            }
            // The slot's lap ran ahead of the cursor value we read: another
            // producer already went through this slot and moved the cursor.
            // Retry with a fresh cursor.
        }
    }

    /// Claims the slot the recv cursor addresses for reading, or reports
    /// that nothing is ready there.
    fn claim_read(&self) -> Option<(usize, u16)> {
        loop {
            let x = self.recv.load(Ordering::Acquire);
            let pos = x & POS_MASK;
            let lap = (x >> LAP_SHIFT) as u16;
            let slot = &self.buf[pos as usize];
            let elap = slot.lap.load(Ordering::Acquire);

            let delta = lap_delta(lap, elap);
            if delta == 0 {
                let next = self.next_cursor(x, pos, lap);
                if self
                    .recv
                    .compare_exchange_weak(x, next, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some((pos as usize, elap));
                }
            } else if delta > 0 {
                // Nothing written here on this lap yet, or a peek has the
                // cursor parked. Re-read once in case a producer published
                // between the two loads above.
                if lap_delta(lap, slot.lap.load(Ordering::Acquire)) > 0 {
                    return None;
                }
            }
            // Another consumer already took this slot and moved the cursor.
        }
    }

    /// Attempts to move `value` into the queue.
    ///
    /// Never blocks. When the queue is full or closed the value is handed
    /// back inside the error.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let (idx, elap) = match self.claim_write() {
            Ok(claim) => claim,
            Err(Reject::Full) => return Err(TrySendError::Full(value)),
            Err(Reject::Closed) => return Err(TrySendError::Closed(value)),
        };
        let slot = &self.buf[idx];

        // We own the slot until the lap store below publishes it.
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.lap.store(next_lap(elap), Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Attempts to insert a clone of `value`.
    ///
    /// The clone is taken up front, so a `Clone` impl that panics cannot
    /// leave a claimed slot unpublished.
    pub fn try_send_ref(&self, value: &T) -> Result<(), TrySendRefError>
    where
        T: Clone,
    {
        match self.try_send(value.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TrySendRefError::Full),
            Err(TrySendError::Closed(_)) => Err(TrySendRefError::Closed),
        }
    }

    /// Attempts to take the element at the front of the queue.
    ///
    /// Never blocks. Consumers keep draining after [`Queue::close`]; once
    /// the ring is empty this fails forever.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let (idx, elap) = self.claim_read().ok_or(TryRecvError)?;
        let slot = &self.buf[idx];

        // We own the slot; the value was published by the release store that
        // made its lap odd.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.lap.store(next_lap(elap), Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);

        Ok(value)
    }

    /// Copies the element at the front of the queue without removing it.
    ///
    /// The peek claims the front slot by parking the recv cursor on it,
    /// copies the value while nothing else can touch the slot, then restores
    /// the cursor to its pre-claim state. Peeking is therefore idempotent
    /// and the next [`Queue::try_recv`] drains the same element. While the
    /// copy is in flight, concurrent receivers and peekers observe an empty
    /// queue; they are never blocked.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let x = self.recv.load(Ordering::Acquire);
            let pos = x & POS_MASK;
            let lap = (x >> LAP_SHIFT) as u16;
            let slot = &self.buf[pos as usize];
            let elap = slot.lap.load(Ordering::Acquire);

            let delta = lap_delta(lap, elap);
            if delta == 0 {
                // Park the cursor on this position, two laps ahead. A parked
                // cursor matches no slot lap, so no receiver or peeker can
                // move it until the restore below, and the slot, staying on
                // an odd lap, cannot be drained or rewritten. The claim
                // leaves us the only thread with access to the value.
                let park = (((lap.wrapping_add(2) & LAP_MASK) as u32) << LAP_SHIFT) | pos;
                if self
                    .recv
                    .compare_exchange_weak(x, park, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // Copy types leave the slot initialized after the read.
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    // Exclusive: nothing else writes the cursor while parked.
                    self.recv.store(x, Ordering::Release);
                    return Some(value);
                }
            } else if delta > 0 {
                // Empty at this position, or another peek holds the slot.
                // Re-read once to close the race with an in-flight publish.
                if lap_delta(lap, slot.lap.load(Ordering::Acquire)) > 0 {
                    return None;
                }
            }
        }
    }

    /// Closes the queue for producers.
    ///
    /// Idempotent. Later [`Queue::try_send`] calls fail with
    /// [`TrySendError::Closed`]; consumers drain whatever is already in the
    /// ring and then see empty.
    pub fn close(&self) {
        // Relaxed is enough: the flag never synchronizes element data, it
        // only gates producers, and every claim re-observes it through the
        // acquire load that starts the loop.
        self.send.fetch_or(CLOSED, Ordering::Relaxed);
    }

    /// True once [`Queue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.send.load(Ordering::Relaxed) & CLOSED != 0
    }

    /// Advisory number of elements in the queue.
    ///
    /// The counter trails the lap publications, so a racing observer can
    /// read a value that is off by the number of operations in flight.
    /// Treat it as a hint, never as a correctness input.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }

    /// True when [`Queue::len`] reads zero. Advisory, like `len`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots the queue was built with.
    pub fn capacity(&self) -> usize {
        self.cap as usize
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// Safety: slot access is mediated by the lap protocol, which hands each slot
// to exactly one thread between lap publications. T: Send because an element
// inserted on one thread may be taken or dropped on another.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Exclusive access. A slot on an odd lap holds an element that was
        // published but never drained.
        for slot in self.buf.iter_mut() {
            if *slot.lap.get_mut() & 1 == 1 {
                unsafe {
                    slot.value.get_mut().assume_init_drop();
                }
            }
        }
    }
}
