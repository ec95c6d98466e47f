use core::fmt::{self, Display, Formatter};

/// Recoverable failures of space management.
///
/// Corruption and protocol violations are not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Not enough free sectors for the request
    NoSpace,
    /// The request would grow a file past what the two-level index can address
    FileTooLarge,
    /// The free map could not be written back to its backing file
    PersistFailed,
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NoSpace => write!(f, "no free sectors left"),
            FsError::FileTooLarge => write!(f, "file exceeds the maximum indexable size"),
            FsError::PersistFailed => write!(f, "failed to persist the free map"),
        }
    }
}
