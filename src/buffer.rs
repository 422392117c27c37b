use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use log::debug;

use crate::element::Element;
use crate::handle::{Consumer, Producer};
use crate::region::{self, MirroredRegion};
use crate::state::{BipState, Cursors};
use crate::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct BipConfig {
    /// Capacity in elements.
    pub capacity: usize,
    /// Round the region up to a page multiple. When false, a capacity whose
    /// byte size is not a page multiple fails with [`Error::Alignment`].
    pub round_to_page: bool,
    /// Touch every page at creation.
    pub prefault: bool,
    /// `mlock` the region.
    pub memlock: bool,
    /// Label for the backing shared memory object.
    pub name: &'static str,
}

impl Default for BipConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            round_to_page: true,
            prefault: false,
            memlock: false,
            name: "bipring",
        }
    }
}

impl BipConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Byte length of the mirrored region backing `capacity` elements of `T`.
    pub fn region_len<T: Element>(&self) -> Result<usize> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be non-zero"));
        }
        let bytes = self
            .capacity
            .checked_mul(size_of::<T>())
            .ok_or(Error::InvalidConfig("capacity overflows region size"))?;
        if self.round_to_page {
            return region::round_to_page(bytes)
                .ok_or(Error::InvalidConfig("capacity overflows region size"));
        }
        Ok(bytes)
    }
}

/// State plus storage, shared by the two handles.
pub(crate) struct Shared<T: Element> {
    pub(crate) state: BipState,
    pub(crate) region: MirroredRegion,
    _element: PhantomData<T>,
}

impl<T: Element> Shared<T> {
    /// # Safety
    ///
    /// `[offset, offset + len)` must be a window the caller's role currently
    /// holds through the cursor protocol.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn window_mut(&self, offset: usize, len: usize) -> Result<&mut [T]> {
        self.region.elements_mut::<T>(offset, len)
    }

    /// # Safety
    ///
    /// Same contract as [`Shared::window_mut`].
    pub(crate) unsafe fn window(&self, offset: usize, len: usize) -> Result<&[T]> {
        self.region.elements::<T>(offset, len)
    }
}

/// A single-producer/single-consumer bip buffer of `T` elements.
///
/// ```
/// use bipring::BipBuffer;
///
/// let buffer = BipBuffer::<u16>::create(1024)?;
/// let (producer, consumer) = buffer.split();
///
/// let mut grant = producer.reserve(4)?;
/// grant.copy_from_slice(&[1, 2, 3, 4]);
/// grant.commit(4)?;
///
/// let grant = consumer.read()?;
/// assert_eq!(&grant[..], &[1, 2, 3, 4]);
/// grant.release(4);
/// # Ok::<(), bipring::Error>(())
/// ```
pub struct BipBuffer<T: Element = u8> {
    shared: Shared<T>,
}

impl<T: Element> BipBuffer<T> {
    pub fn create(capacity: usize) -> Result<Self> {
        Self::create_with_config(BipConfig::new(capacity))
    }

    pub fn create_with_config(config: BipConfig) -> Result<Self> {
        let len = config.region_len::<T>()?;
        let region = MirroredRegion::create_named(config.name, len)?;
        if config.prefault {
            region.prefault();
        }
        if config.memlock {
            region.lock()?;
        }
        debug!(
            "bip buffer {}: {} elements of {} bytes in a {} byte region",
            config.name,
            config.capacity,
            size_of::<T>(),
            len
        );
        Ok(Self {
            shared: Shared {
                state: BipState::new(config.capacity),
                region,
                _element: PhantomData,
            },
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.capacity()
    }

    pub fn cursors(&self) -> Cursors {
        self.shared.state.cursors()
    }

    pub fn region(&self) -> &MirroredRegion {
        &self.shared.region
    }

    /// Hands out the one producer and the one consumer for this buffer.
    ///
    /// The region is unmapped when both handles are dropped.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let shared = Arc::new(self.shared);
        (Producer::new(Arc::clone(&shared)), Consumer::new(shared))
    }

    /// Tears the buffer down without splitting it.
    pub fn destroy(self) {
        drop(self);
    }
}
