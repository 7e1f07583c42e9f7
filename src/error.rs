use core::fmt;

/// Why a write stopped early.
///
/// A stopped write is not rolled back: the payload says how many bytes
/// made it out, those bytes are kept, and the file length grows to
/// cover them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The target range runs past the triple-indirect maximum.
    OutOfRange { written: usize },
    /// The free map could not supply another sector.
    NoSpace { written: usize },
    /// A holder of the inode currently denies writes.
    Denied,
}

impl WriteError {
    /// Bytes written before the stop.
    pub fn written(&self) -> usize {
        match *self {
            WriteError::OutOfRange { written } | WriteError::NoSpace { written } => written,
            WriteError::Denied => 0,
        }
    }

    // Shift the progress count by `base` bytes that an outer loop had
    // already written.
    pub(crate) fn rebase(self, base: usize) -> Self {
        match self {
            WriteError::OutOfRange { written } => WriteError::OutOfRange {
                written: base + written,
            },
            WriteError::NoSpace { written } => WriteError::NoSpace {
                written: base + written,
            },
            WriteError::Denied => WriteError::Denied,
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::OutOfRange { written } => {
                write!(f, "offset past the addressable maximum ({} bytes written)", written)
            }
            WriteError::NoSpace { written } => {
                write!(f, "free map exhausted ({} bytes written)", written)
            }
            WriteError::Denied => write!(f, "writes denied"),
        }
    }
}
