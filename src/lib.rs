//! Lock-free single-producer/single-consumer bip buffer over a mirrored
//! memory region.
//!
//! The producer reserves a contiguous window, fills it in place and commits
//! it; the consumer reads the committed window in place and releases it.
//! No operation blocks: one that cannot proceed returns an error the caller
//! is expected to retry.
//!
//! Each role may hold at most one outstanding window. There is no
//! cancellation, so a grant that is never committed or released stalls its
//! role for the life of the buffer.

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("bipring needs memfd (Linux) or POSIX shm (macOS) for its mirrored region");

pub mod buffer;
pub mod element;
pub mod error;
pub mod handle;
pub mod region;
mod state;

pub use buffer::{BipBuffer, BipConfig, DEFAULT_CAPACITY};
pub use element::Element;
pub use error::{Error, Result};
pub use handle::{Consumer, Producer, ReadGrant, WriteGrant};
pub use region::{page_size, MirroredRegion};
pub use state::Cursors;
