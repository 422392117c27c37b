use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("region length {len} is not a non-zero multiple of the page size ({page_size})")]
    Alignment { len: usize, page_size: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("range out of bounds")]
    OutOfBounds,
    #[error("a reservation is already outstanding")]
    AlreadyReserving,
    #[error("a readable window is already outstanding")]
    AlreadyReading,
    #[error("insufficient space for {requested} elements")]
    InsufficientSpace { requested: usize },
    #[error("no active reservation")]
    NoActiveReservation,
}

impl Error {
    /// Capacity pressure that clears once the other side makes progress.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::InsufficientSpace { .. })
    }

    /// A role tried to hold more than one outstanding window.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::AlreadyReserving | Error::AlreadyReading | Error::NoActiveReservation
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
