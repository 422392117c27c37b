use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::trace;

use crate::{Error, Result};

/// A producer's claim on `[offset, offset + len)`, pending commit.
///
/// Only [`BipState::reserve`] creates one and [`BipState::commit`] consumes
/// it, so a descriptor cannot be committed twice.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Reservation {
    offset: usize,
    length: usize,
}

impl Reservation {
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }
}

/// The consumer's current readable window. `len()` may be zero.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Readable {
    offset: usize,
    length: usize,
}

impl Readable {
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }
}

/// Point-in-time copy of every cursor, for diagnostics and tests.
///
/// Taken without stopping either role, so a snapshot is only exact when both
/// sides are quiescent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursors {
    pub write: usize,
    pub read: usize,
    pub last: usize,
    pub reserve: usize,
    pub write_in_progress: bool,
    pub read_in_progress: bool,
}

impl Cursors {
    /// The producer has wrapped and the consumer has not caught up yet.
    pub fn is_inverted(&self) -> bool {
        self.write < self.read
    }

    /// Committed elements the consumer has not released, across both halves
    /// when inverted.
    pub fn unread(&self) -> usize {
        if self.is_inverted() {
            self.last.saturating_sub(self.read) + self.write
        } else {
            self.write - self.read
        }
    }

    /// Checks the cursor invariants that hold whenever neither role has an
    /// outstanding window.
    pub fn is_consistent(&self, capacity: usize) -> bool {
        let bounded = self.write <= capacity
            && self.read <= capacity
            && self.last <= capacity
            && self.reserve <= capacity;
        let ordered = if self.is_inverted() {
            self.read <= self.last
        } else {
            self.read <= self.write
        };
        bounded && ordered
    }
}

#[repr(C, align(128))]
struct ProducerCursors {
    write: AtomicUsize,
    last: AtomicUsize,
    reserve: AtomicUsize,
    write_in_progress: AtomicBool,
    committed: AtomicBool,
}

#[repr(C, align(128))]
struct ConsumerCursors {
    read: AtomicUsize,
    read_in_progress: AtomicBool,
}

/// Cursor set of one bip buffer.
///
/// Not inverted (`write >= read`): unread data is `[read, write)`.
/// Inverted (`write < read`): unread data is `[read, last)` then `[0, write)`.
///
/// `write`, `last`, `reserve` and `write_in_progress` are only stored by the
/// producer; `read` and `read_in_progress` only by the consumer. The two
/// groups sit on separate cache lines. The consumer's acquire loads of
/// `write`/`last` pair with the producer's release stores in `commit`, and
/// the producer's acquire load of `read` pairs with the consumer's release
/// store in `release`.
///
/// Crate-private: descriptors are only ever finalized through the grant
/// types, which carry the one descriptor their window came from.
pub(crate) struct BipState {
    capacity: usize,
    producer: ProducerCursors,
    consumer: ConsumerCursors,
}

impl BipState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            producer: ProducerCursors {
                write: AtomicUsize::new(0),
                last: AtomicUsize::new(0),
                reserve: AtomicUsize::new(0),
                write_in_progress: AtomicBool::new(false),
                committed: AtomicBool::new(false),
            },
            consumer: ConsumerCursors {
                read: AtomicUsize::new(0),
                read_in_progress: AtomicBool::new(false),
            },
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims `size` contiguous elements for the producer.
    pub(crate) fn reserve(&self, size: usize) -> Result<Reservation> {
        if self
            .producer
            .write_in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::AlreadyReserving);
        }

        let write = self.producer.write.load(Ordering::Relaxed);
        let read = self.consumer.read.load(Ordering::Acquire);
        let end = write.saturating_add(size);

        let start = if write < read {
            // Inverted: grow towards read, keeping one element of daylight
            // so write never catches read.
            (end < read).then_some(write)
        } else if end <= self.capacity {
            Some(write)
        } else if size < read {
            Some(0)
        } else {
            None
        };

        let Some(start) = start else {
            self.producer
                .write_in_progress
                .store(false, Ordering::Release);
            return Err(Error::InsufficientSpace { requested: size });
        };

        self.producer.reserve.store(start + size, Ordering::Relaxed);
        Ok(Reservation {
            offset: start,
            length: size,
        })
    }

    /// Publishes the first `used` elements of `reservation`.
    ///
    /// `used` is clamped to the reservation length; the rest goes back to
    /// free space.
    pub(crate) fn commit(&self, reservation: Reservation, used: usize) -> Result<()> {
        if !self.producer.write_in_progress.load(Ordering::Acquire) {
            return Err(Error::NoActiveReservation);
        }
        let used = used.min(reservation.length);
        let write = self.producer.write.load(Ordering::Relaxed);

        if used == 0 {
            self.producer.reserve.store(write, Ordering::Relaxed);
            self.producer
                .write_in_progress
                .store(false, Ordering::Release);
            return Ok(());
        }

        let first_commit = !self.producer.committed.swap(true, Ordering::Relaxed);
        let new_write = if first_commit || reservation.offset == write {
            reservation.offset + used
        } else {
            // The reservation wrapped to zero. `last` must be visible before
            // the new `write`, or the consumer could see an inverted buffer
            // with a stale end.
            trace!("producer wrapped: last = {write}, write = {used}");
            self.producer.last.store(write, Ordering::Release);
            used
        };

        self.producer.write.store(new_write, Ordering::Release);
        self.producer.reserve.store(new_write, Ordering::Relaxed);
        self.producer
            .write_in_progress
            .store(false, Ordering::Release);
        Ok(())
    }

    /// Returns the consumer's current readable window.
    ///
    /// The window may be empty; it still has to be released.
    pub(crate) fn read(&self) -> Result<Readable> {
        if self
            .consumer
            .read_in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::AlreadyReading);
        }

        let write = self.producer.write.load(Ordering::Acquire);
        let last = self.producer.last.load(Ordering::Acquire);
        let mut read = self.consumer.read.load(Ordering::Relaxed);

        if read == last && write < read {
            trace!("consumer wrapped at {last}");
            read = 0;
            self.consumer.read.store(0, Ordering::Release);
        }

        let end = if write < read { last } else { write };
        debug_assert!(end >= read, "readable end {end} behind read {read}");
        Ok(Readable {
            offset: read,
            length: end.saturating_sub(read),
        })
    }

    /// Frees the first `used` elements of `readable`.
    ///
    /// Does nothing if no window is outstanding.
    pub(crate) fn release(&self, readable: Readable, used: usize) {
        if !self.consumer.read_in_progress.load(Ordering::Acquire) {
            return;
        }
        let used = used.min(readable.length);
        debug_assert_eq!(
            self.consumer.read.load(Ordering::Relaxed),
            readable.offset
        );
        self.consumer
            .read
            .store(readable.offset + used, Ordering::Release);
        self.consumer
            .read_in_progress
            .store(false, Ordering::Release);
    }

    /// Largest `size` a `reserve` issued now would grant, ignoring the
    /// guard flag. Only grows until the producer's next commit.
    pub(crate) fn grantable(&self) -> usize {
        let write = self.producer.write.load(Ordering::Relaxed);
        let read = self.consumer.read.load(Ordering::Acquire);
        if write < read {
            read - write - 1
        } else {
            (self.capacity - write).max(read.saturating_sub(1))
        }
    }

    /// Length of the window a `read` issued now would return.
    pub(crate) fn readable(&self) -> usize {
        let write = self.producer.write.load(Ordering::Acquire);
        let last = self.producer.last.load(Ordering::Acquire);
        let read = self.consumer.read.load(Ordering::Acquire);
        if write < read {
            if read == last {
                write
            } else {
                last.saturating_sub(read)
            }
        } else {
            write - read
        }
    }

    pub(crate) fn cursors(&self) -> Cursors {
        Cursors {
            write: self.producer.write.load(Ordering::Acquire),
            read: self.consumer.read.load(Ordering::Acquire),
            last: self.producer.last.load(Ordering::Acquire),
            reserve: self.producer.reserve.load(Ordering::Acquire),
            write_in_progress: self.producer.write_in_progress.load(Ordering::Acquire),
            read_in_progress: self.consumer.read_in_progress.load(Ordering::Acquire),
        }
    }
}
