use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use log::{debug, warn};

use crate::element::Element;
use crate::{Error, Result};

/// A shared memory object mapped twice, back to back.
///
/// Byte `i` and byte `i + len` of the mapping alias the same physical page
/// for every `i` in `[0, len)`, so a window of up to `len` bytes starting
/// anywhere in `[0, len]` is contiguous valid memory even when it runs past
/// the nominal end.
///
/// The region does not track who owns which bytes. Callers obtain windows
/// through the cursor protocol (see [`crate::Producer`] and
/// [`crate::Consumer`]) and only then slice.
pub struct MirroredRegion {
    base: NonNull<u8>,
    len: usize,
    backing: OwnedFd,
}

// SAFETY: the region owns both mappings and the backing descriptor; all
// access to the mapped bytes goes through the unsafe slicing methods whose
// callers guarantee disjointness.
unsafe impl Send for MirroredRegion {}
unsafe impl Sync for MirroredRegion {}

impl MirroredRegion {
    pub fn create(len: usize) -> Result<Self> {
        Self::create_named("bipring", len)
    }

    /// Like [`MirroredRegion::create`], labelling the backing object with
    /// `name` (visible in `/proc/<pid>/maps` on Linux).
    pub fn create_named(name: &str, len: usize) -> Result<Self> {
        let page_size = page_size();
        if len == 0 || len % page_size != 0 {
            return Err(Error::Alignment { len, page_size });
        }
        let span = len
            .checked_mul(2)
            .ok_or(Error::InvalidConfig("region length exceeds address space"))?;
        let file_len = libc::off_t::try_from(len)
            .map_err(|_| Error::InvalidConfig("region length exceeds off_t"))?;

        let backing = open_backing(name)?;
        if unsafe { libc::ftruncate(backing.as_raw_fd(), file_len) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        // Reserve the whole span first so nothing else can land between the
        // two halves.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned a null reservation",
            ))
        })?;

        // From here on Drop unmaps the full span if either half fails.
        let region = Self { base, len, backing };
        region.map_half(0)?;
        region.map_half(len)?;
        debug!(
            "mirrored region {name}: {len} bytes at {:p} (mirror at {:p})",
            region.base.as_ptr(),
            region.base.as_ptr().wrapping_add(len)
        );
        Ok(region)
    }

    fn map_half(&self, offset: usize) -> Result<()> {
        let target = self.base.as_ptr().wrapping_add(offset).cast::<libc::c_void>();
        let mapped = unsafe {
            libc::mmap(
                target,
                self.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.backing.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if mapped != target {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fixed mapping landed at a different address",
            )));
        }
        Ok(())
    }

    /// Nominal length in bytes (half of the mapped span).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of `T` elements that fit in one copy of the region.
    pub fn element_capacity<T: Element>(&self) -> usize {
        self.len / size_of::<T>()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns `length` bytes starting at `offset`.
    ///
    /// Accepts `offset <= len` and `length <= len`; anything else is
    /// [`Error::OutOfBounds`].
    ///
    /// # Safety
    ///
    /// No mutable view may overlap `[offset, offset + length)` (modulo the
    /// mirror) for the lifetime of the returned slice.
    pub unsafe fn slice(&self, offset: usize, length: usize) -> Result<&[u8]> {
        self.check_range(offset, length)?;
        Ok(std::slice::from_raw_parts(self.base.as_ptr().add(offset), length))
    }

    /// Returns a mutable view of `length` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive rights to `[offset, offset + length)`
    /// (modulo the mirror) for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, length: usize) -> Result<&mut [u8]> {
        self.check_range(offset, length)?;
        Ok(std::slice::from_raw_parts_mut(
            self.base.as_ptr().add(offset),
            length,
        ))
    }

    /// Typed variant of [`MirroredRegion::slice`]; `offset` and `count` are
    /// in elements.
    ///
    /// # Safety
    ///
    /// Same contract as [`MirroredRegion::slice`].
    pub unsafe fn elements<T: Element>(&self, offset: usize, count: usize) -> Result<&[T]> {
        let (byte_offset, byte_len) = element_range::<T>(offset, count)?;
        self.check_range(byte_offset, byte_len)?;
        let ptr = self.base.as_ptr().add(byte_offset).cast::<T>();
        Ok(std::slice::from_raw_parts(ptr, count))
    }

    /// Typed variant of [`MirroredRegion::slice_mut`].
    ///
    /// # Safety
    ///
    /// Same contract as [`MirroredRegion::slice_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn elements_mut<T: Element>(&self, offset: usize, count: usize) -> Result<&mut [T]> {
        let (byte_offset, byte_len) = element_range::<T>(offset, count)?;
        self.check_range(byte_offset, byte_len)?;
        let ptr = self.base.as_ptr().add(byte_offset).cast::<T>();
        Ok(std::slice::from_raw_parts_mut(ptr, count))
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<()> {
        if offset > self.len || length > self.len {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    /// Writes a zero into every page so the first producer pass does not
    /// take page faults on the hot path.
    pub(crate) fn prefault(&self) {
        let page_size = page_size();
        let mut offset = 0;
        while offset < self.len {
            // SAFETY: offset < len, and the region is not yet shared.
            unsafe { ptr::write_volatile(self.base.as_ptr().add(offset), 0) };
            offset += page_size;
        }
    }

    /// Pins the pages in RAM.
    pub fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::mlock(self.base.as_ptr().cast::<libc::c_void>(), self.len * 2) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MirroredRegion {
    fn drop(&mut self) {
        // One munmap covers both halves and the PROT_NONE reservation.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.len * 2) };
        if rc != 0 {
            warn!(
                "munmap of mirrored region failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            debug!("mirrored region at {:p} unmapped", self.base.as_ptr());
        }
        // The backing descriptor closes when `backing` drops.
    }
}

/// The system page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Rounds `len` up to the next page multiple.
pub fn round_to_page(len: usize) -> Option<usize> {
    let page_size = page_size();
    len.checked_add(page_size - 1)
        .map(|value| value / page_size * page_size)
}

fn element_range<T: Element>(offset: usize, count: usize) -> Result<(usize, usize)> {
    let byte_offset = offset
        .checked_mul(size_of::<T>())
        .ok_or(Error::OutOfBounds)?;
    let byte_len = count.checked_mul(size_of::<T>()).ok_or(Error::OutOfBounds)?;
    Ok((byte_offset, byte_len))
}

#[cfg(target_os = "linux")]
fn open_backing(name: &str) -> Result<OwnedFd> {
    use std::ffi::CString;

    let name = CString::new(name)
        .map_err(|_| Error::InvalidConfig("region name contains null byte"))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(target_os = "macos")]
fn open_backing(name: &str) -> Result<OwnedFd> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_ID: AtomicU32 = AtomicU32::new(0);

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let path = CString::new(format!("/{name}-{}-{id}", std::process::id()))
        .map_err(|_| Error::InvalidConfig("region name contains null byte"))?;
    let fd = unsafe {
        libc::shm_open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // The object stays alive through the descriptor and the mappings.
    unsafe { libc::shm_unlink(path.as_ptr()) };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_length() {
        let page = page_size();
        match MirroredRegion::create(page + 1) {
            Err(Error::Alignment { len, page_size }) => {
                assert_eq!(len, page + 1);
                assert_eq!(page_size, page);
            }
            other => panic!("expected alignment error, got {:?}", other.map(|r| r.len())),
        }
        assert!(matches!(
            MirroredRegion::create(0),
            Err(Error::Alignment { len: 0, .. })
        ));
    }

    #[test]
    fn writes_alias_across_the_mirror() -> Result<()> {
        let len = page_size();
        let region = MirroredRegion::create(len)?;
        unsafe {
            region.slice_mut(0, 4)?.copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(region.slice(len, 4)?, &[1, 2, 3, 4]);

            region.slice_mut(len - 2, 2)?.copy_from_slice(&[9, 8]);
            assert_eq!(region.slice(len - 2, 4)?, &[9, 8, 1, 2]);
        }
        Ok(())
    }

    #[test]
    fn window_across_end_is_contiguous() -> Result<()> {
        let len = page_size() * 2;
        let region = MirroredRegion::create(len)?;
        unsafe {
            let window = region.slice_mut(len - 3, 6)?;
            window.copy_from_slice(&[10, 11, 12, 13, 14, 15]);
            assert_eq!(region.slice(len - 3, 3)?, &[10, 11, 12]);
            assert_eq!(region.slice(0, 3)?, &[13, 14, 15]);
        }
        Ok(())
    }

    #[test]
    fn typed_views_share_storage() -> Result<()> {
        let len = page_size();
        let region = MirroredRegion::create(len)?;
        let elements = region.element_capacity::<u16>();
        assert_eq!(elements, len / 2);
        unsafe {
            region
                .elements_mut::<u16>(elements - 1, 2)?
                .copy_from_slice(&[0xBEEF, 0xCAFE]);
            assert_eq!(region.elements::<u16>(0, 1)?, &[0xCAFE]);
            assert_eq!(region.elements::<u16>(elements - 1, 1)?, &[0xBEEF]);
        }
        Ok(())
    }

    #[test]
    fn out_of_range_slices_are_rejected() -> Result<()> {
        let len = page_size();
        let region = MirroredRegion::create(len)?;
        unsafe {
            assert!(matches!(region.slice(len + 1, 1), Err(Error::OutOfBounds)));
            assert!(matches!(region.slice(0, len + 1), Err(Error::OutOfBounds)));
            assert!(region.slice(len - 1, len).is_ok());
            assert!(region.slice(len, 0)?.is_empty());

            // A window may start exactly at the mirror and span all of it.
            region.slice_mut(0, 2)?.copy_from_slice(&[7, 6]);
            let mirror = region.slice(len, len)?;
            assert_eq!(mirror.len(), len);
            assert_eq!(&mirror[..2], &[7, 6]);
        }
        Ok(())
    }

    #[test]
    fn prefault_and_round_up() -> Result<()> {
        let page = page_size();
        let region = MirroredRegion::create(page * 4)?;
        region.prefault();
        assert_eq!(unsafe { region.slice(page * 3, 1)? }, &[0]);
        assert_eq!(round_to_page(1), Some(page));
        assert_eq!(round_to_page(page), Some(page));
        assert_eq!(round_to_page(page + 1), Some(page * 2));
        assert_eq!(round_to_page(usize::MAX), None);
        Ok(())
    }
}
