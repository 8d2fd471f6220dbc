use std::io;
use std::time::Duration;

use thiserror::Error;

/// A custom `Result` type for this crate, combining a return value with an [`Error`]. It is used
/// all over the crate and also returned by most functions and methods of its external API.
pub type Result<T> = std::result::Result<T, Error>;

/// An error type returned by calls to the API exposed by this crate.
///
/// Variants fall in four groups: environment errors (procfs could not be read or did not look
/// the way it should), lookup failures, privilege failures, and region-level failures that a
/// scan may choose to skip.
#[derive(Debug, Error)]
pub enum Error {
    /// Error opening a file.
    #[error("could not open '{path}': {source}")]
    Open {
        /// The path of the file that was attempted to be opened.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error reading from a file.
    #[error("could not read '{path}': {source}")]
    Read {
        /// The path of the file that was attempted to be read.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error listing a directory.
    #[error("could not list directory '{path}': {source}")]
    ReadDir {
        /// The directory that was attempted to be listed.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// The address field of a maps line is not made of exactly two hyphen-separated tokens.
    #[error("could not parse address range from '{0}'")]
    MalformedAddressRange(String),

    /// A maps line lacks a mandatory field.
    #[error("malformed maps line: '{0}'")]
    MalformedMapLine(String),

    /// A bound of an address range is not hexadecimal.
    #[error("could not parse address '{addr}': {source}")]
    ParseAddress {
        /// The offending token.
        addr: String,
        /// The underlying error.
        source: std::num::ParseIntError,
    },

    /// Error parsing [`PagePermissions`].
    ///
    /// [`PagePermissions`]: struct.PagePermissions.html
    #[error("could not parse valid PagePermissions from '{0}'")]
    ParsePagePermissions(String),

    /// No process under the process-information root carries the requested name.
    #[error("no process named '{0}' was found")]
    ProcessNotFound(String),

    /// The caller may not read other processes' memory.
    #[error("insufficient privilege: root or CAP_SYS_PTRACE is required")]
    InsufficientPrivilege,

    /// Error retrieving `capabilities(7)`. Wrapper for [`CapsError`].
    ///
    /// [`CapsError`]: https://docs.rs/caps/0.5/caps/errors/struct.CapsError.html
    #[error(transparent)]
    Caps(#[from] caps::errors::CapsError),

    /// The region disappeared (or shrank) between reading the map listing and reading memory.
    #[error("region 0x{start:x}-0x{end:x} is no longer mapped: {source}")]
    StaleRegion {
        /// First address of the region.
        start: u64,
        /// One past the last address of the region.
        end: u64,
        /// The underlying error.
        source: io::Error,
    },

    /// Reading the region did not complete within the configured deadline.
    #[error("reading region 0x{start:x}-0x{end:x} did not finish within {deadline:?}")]
    ReadTimeout {
        /// First address of the region.
        start: u64,
        /// One past the last address of the region.
        end: u64,
        /// The deadline that expired.
        deadline: Duration,
    },

    /// At least one bound of the region overflowed while decoding, so its size is unknown.
    #[error("region '{0}' has an indeterminate size")]
    IndeterminateRegion(String),

    /// An attempt was made to read a region that is not readable.
    #[error("region '{0}' is not readable")]
    RegionNotReadable(String),
}

impl Error {
    /// Returns `true` for the lookup failure, so that callers can tell "no such process" apart
    /// from I/O errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ProcessNotFound(_))
    }

    /// Returns `true` for region-level failures that a scan may skip without invalidating the
    /// rest of its results.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Error::StaleRegion { .. } | Error::ReadTimeout { .. } | Error::IndeterminateRegion(_)
        )
    }
}
