use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::maps::{MemoryRegion, Span};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MemoryChunk
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The bytes read from a single region of a process's memory image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChunk {
    data: Vec<u8>,
}

impl MemoryChunk {
    /// The bytes of the region, in address order.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The number of bytes in the chunk.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the chunk, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl std::convert::From<Vec<u8>> for MemoryChunk {
    fn from(data: Vec<u8>) -> Self {
        MemoryChunk { data }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ReadOptions
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// What a scan does when a single region cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Any failure aborts the whole scan.
    #[default]
    Strict,
    /// Regions that vanished, timed out, or have an indeterminate size are skipped and
    /// reported; every other failure still aborts the scan.
    SkipStale,
}

/// Settings for reading a process's memory image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// What to do about regions that cannot be read.
    pub policy: ReadPolicy,
    /// Upper bound on the time a single region read may take; `None` blocks indefinitely.
    pub deadline: Option<Duration>,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MemoryImage
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A read handle to `/proc/<PID>/mem` (or any file laid out the same way), held for the duration
/// of one scan. The handle is closed when the `MemoryImage` is dropped.
#[derive(Debug)]
pub struct MemoryImage {
    path: String,
    file: File,
    deadline: Option<Duration>,
}

impl MemoryImage {
    /// Open the memory image at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|e| Error::Open {
            path: path.clone(),
            source: e,
        })?;
        debug!(path = %path, "opened memory image");
        Ok(MemoryImage {
            path,
            file,
            deadline: None,
        })
    }

    /// Bound every subsequent [`Self::read_region`] by the given deadline.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// The path the image was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read all bytes of a readable region.
    ///
    /// # Errors
    ///
    /// - [`Error::RegionNotReadable`] if the region lacks the read permission;
    /// - [`Error::IndeterminateRegion`] if the region's size cannot be told;
    /// - [`Error::StaleRegion`] if fewer bytes than the region's size could be read, or if the
    ///   kernel reports that the range is no longer mapped;
    /// - [`Error::ReadTimeout`] if a deadline was set and expired;
    /// - [`Error::Read`] for any other failure (e.g. lacking permission to read the image).
    pub fn read_region(&self, region: &MemoryRegion) -> Result<MemoryChunk> {
        if !region.readable() {
            return Err(Error::RegionNotReadable(region.to_string()));
        }
        let (start, len) = match (region.start().value(), region.span()) {
            (Some(start), Span::Known(len)) => (start as u64, len),
            _ => return Err(Error::IndeterminateRegion(region.to_string())),
        };
        let len_usize =
            usize::try_from(len).map_err(|_| Error::IndeterminateRegion(region.to_string()))?;
        trace!(start, len, key = region.key(), "reading region");

        let data = match self.deadline {
            None => read_span(&self.file, start, len_usize),
            Some(deadline) => self.read_span_with_deadline(start, len_usize, deadline)?,
        };
        data.map(MemoryChunk::from)
            .map_err(|e| self.classify(e, start, start + len))
    }

    /// Runs the read on a worker that owns a duplicate of the handle, so that a read stuck in
    /// the kernel does not hold up the scan. The duplicate is closed once the worker returns.
    fn read_span_with_deadline(
        &self,
        start: u64,
        len: usize,
        deadline: Duration,
    ) -> Result<io::Result<Vec<u8>>> {
        let file = self.file.try_clone().map_err(|e| Error::Open {
            path: self.path.clone(),
            source: e,
        })?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("procmem-region-reader".into())
            .spawn(move || {
                let _ = tx.send(read_span(&file, start, len));
            })
            .map_err(|e| Error::Read {
                path: self.path.clone(),
                source: e,
            })?;

        match rx.recv_timeout(deadline) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(Error::ReadTimeout {
                start,
                end: start + len as u64,
                deadline,
            }),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(io::Error::new(
                io::ErrorKind::Other,
                "region reader exited without a result",
            ))),
        }
    }

    fn classify(&self, e: io::Error, start: u64, end: u64) -> Error {
        if is_vanished(&e) {
            Error::StaleRegion {
                start,
                end,
                source: e,
            }
        } else {
            Error::Read {
                path: self.path.clone(),
                source: e,
            }
        }
    }
}

/// Positional read of exactly `len` bytes at `start`; it does not move the handle's offset, so
/// duplicated handles never interfere with each other.
fn read_span(file: &File, start: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact_at(&mut buf, start)?;
    Ok(buf)
}

/// Errors that `/proc/<PID>/mem` returns for ranges that are (no longer) backed by the process's
/// address space, as opposed to permission problems.
fn is_vanished(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof
        || matches!(
            e.raw_os_error(),
            Some(libc::EIO) | Some(libc::ESRCH) | Some(libc::EFAULT) | Some(libc::ENOMEM)
        )
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
