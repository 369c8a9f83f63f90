use std::{error, fmt};

/// Dynarec failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A host mapping or reallocation failed. Aborts the current
    /// translation; the dispatcher falls back to interpretation.
    OutOfMemory,
    /// A host signal arrived during translated execution and maps to a
    /// guest exception; re-raised through the context's signal table.
    GuestFault,
    /// The translator met an instruction it does not handle. The dispatcher
    /// interprets one instruction and retries at the next address.
    Untranslatable,
    /// A lookup raced with an invalidation. The unmap contract forbids
    /// this; treat as a programming error.
    InvalidatedUnderfoot,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfMemory => "out of executable memory",
            Self::GuestFault => "guest fault",
            Self::Untranslatable => "untranslatable instruction",
            Self::InvalidatedUnderfoot => "block invalidated underfoot",
        })
    }
}

impl error::Error for Error {}
