use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::warn;

use crate::buffer::Shared;
use crate::element::Element;
use crate::state::{Cursors, Readable, Reservation};
use crate::{Error, Result};

// Send but not Sync: a handle moves to its thread and stays there.
type NotSync = PhantomData<Cell<()>>;

/// Write side of a bip buffer.
pub struct Producer<T: Element = u8> {
    shared: Arc<Shared<T>>,
    _not_sync: NotSync,
}

/// Read side of a bip buffer.
pub struct Consumer<T: Element = u8> {
    shared: Arc<Shared<T>>,
    _not_sync: NotSync,
}

impl<T: Element> Producer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared,
            _not_sync: PhantomData,
        }
    }

    /// Claims exactly `size` contiguous elements.
    ///
    /// Fails with [`Error::AlreadyReserving`] while another grant from this
    /// producer is alive, and with [`Error::InsufficientSpace`] when the
    /// consumer has not freed enough room yet.
    pub fn reserve(&self, size: usize) -> Result<WriteGrant<'_, T>> {
        let reservation = self.shared.state.reserve(size)?;
        // SAFETY: the state just granted this window to the producer and
        // nothing else can be granted to it before commit.
        let buf = match unsafe {
            self.shared
                .window_mut(reservation.offset(), reservation.len())
        } {
            Ok(buf) => buf,
            // Unreachable while grants stay below capacity, which never
            // exceeds the region; rolled back so the guard is not left set.
            Err(err) => {
                self.shared.state.commit(reservation, 0)?;
                return Err(err);
            }
        };
        Ok(WriteGrant {
            shared: &self.shared,
            reservation: Some(reservation),
            buf,
        })
    }

    /// Copies as much of `src` as fits into one contiguous window and
    /// commits it. Returns the number of elements written.
    pub fn push_slice(&self, src: &[T]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let size = src.len().min(self.shared.state.grantable());
        if size == 0 {
            return Err(Error::InsufficientSpace {
                requested: src.len(),
            });
        }
        let mut grant = self.reserve(size)?;
        grant.copy_from_slice(&src[..size]);
        grant.commit(size)?;
        Ok(size)
    }

    /// Largest reservation that would currently succeed.
    pub fn grantable(&self) -> usize {
        self.shared.state.grantable()
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.capacity()
    }

    pub fn cursors(&self) -> Cursors {
        self.shared.state.cursors()
    }
}

impl<T: Element> Consumer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared,
            _not_sync: PhantomData,
        }
    }

    /// Returns everything contiguously readable right now, possibly empty.
    ///
    /// When the producer has wrapped, the tail `[read, last)` comes first;
    /// the head at offset zero is returned by the read after it is released.
    pub fn read(&self) -> Result<ReadGrant<'_, T>> {
        let readable = self.shared.state.read()?;
        // SAFETY: committed and not yet released, so the producer will not
        // hand this window out until release.
        let buf = match unsafe { self.shared.window(readable.offset(), readable.len()) } {
            Ok(buf) => buf,
            // Unreachable for the same reason as in `Producer::reserve`.
            Err(err) => {
                self.shared.state.release(readable, 0);
                return Err(err);
            }
        };
        Ok(ReadGrant {
            shared: &self.shared,
            readable: Some(readable),
            buf,
        })
    }

    /// Copies up to `dst.len()` readable elements into `dst` and releases
    /// them. Returns the number copied, zero when nothing is pending.
    pub fn read_into(&self, dst: &mut [T]) -> Result<usize> {
        let grant = self.read()?;
        let count = grant.len().min(dst.len());
        dst[..count].copy_from_slice(&grant[..count]);
        grant.release(count);
        Ok(count)
    }

    /// Length of the window `read` would return now.
    pub fn available(&self) -> usize {
        self.shared.state.readable()
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.capacity()
    }

    pub fn cursors(&self) -> Cursors {
        self.shared.state.cursors()
    }
}

/// Writable window handed out by [`Producer::reserve`].
///
/// Must be finished with [`WriteGrant::commit`]. A grant that is dropped
/// instead leaves the reservation outstanding and every later `reserve` on
/// the producer fails with [`Error::AlreadyReserving`].
#[must_use = "a reservation that is never committed stalls the producer"]
pub struct WriteGrant<'a, T: Element> {
    shared: &'a Shared<T>,
    reservation: Option<Reservation>,
    buf: &'a mut [T],
}

impl<'a, T: Element> WriteGrant<'a, T> {
    pub fn offset(&self) -> usize {
        self.reservation.as_ref().map_or(0, Reservation::offset)
    }

    /// Publishes the first `used` elements; clamped to the grant length.
    pub fn commit(mut self, used: usize) -> Result<()> {
        match self.reservation.take() {
            Some(reservation) => self.shared.state.commit(reservation, used),
            None => Err(Error::NoActiveReservation),
        }
    }
}

impl<T: Element> Deref for WriteGrant<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &*self.buf
    }
}

impl<T: Element> DerefMut for WriteGrant<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut *self.buf
    }
}

impl<T: Element> Drop for WriteGrant<'_, T> {
    fn drop(&mut self) {
        if let Some(reservation) = &self.reservation {
            warn!(
                "write grant at {} (len {}) dropped without commit; producer is stalled",
                reservation.offset(),
                reservation.len()
            );
        }
    }
}

/// Readable window handed out by [`Consumer::read`].
///
/// Must be finished with [`ReadGrant::release`]; dropping it leaves the
/// consumer stalled the same way an uncommitted [`WriteGrant`] stalls the
/// producer.
#[must_use = "a readable window that is never released stalls the consumer"]
pub struct ReadGrant<'a, T: Element> {
    shared: &'a Shared<T>,
    readable: Option<Readable>,
    buf: &'a [T],
}

impl<'a, T: Element> ReadGrant<'a, T> {
    pub fn offset(&self) -> usize {
        self.readable.as_ref().map_or(0, Readable::offset)
    }

    /// Frees the first `used` elements; clamped to the grant length.
    pub fn release(mut self, used: usize) {
        if let Some(readable) = self.readable.take() {
            self.shared.state.release(readable, used);
        }
    }
}

impl<T: Element> Deref for ReadGrant<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.buf
    }
}

impl<T: Element> Drop for ReadGrant<'_, T> {
    fn drop(&mut self) {
        if let Some(readable) = &self.readable {
            warn!(
                "read grant at {} (len {}) dropped without release; consumer is stalled",
                readable.offset(),
                readable.len()
            );
        }
    }
}
