//! Storage backend capabilities.
//!
//! A backend is the pluggable storage implementation the device delegates to.
//! Byte-addressable backends implement [`Backend`] directly; block-granular
//! ones implement [`BlockBackend`] and are adapted by
//! [`BlockAligned`](crate::BlockAligned).
//!
//! The serving loop issues at most one operation at a time, so backends are
//! exclusively owned and need no internal locking.

use crate::error::BackendError;
use crate::types::Geometry;

/// Result of a backend operation.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Byte-addressable storage backend.
///
/// `read` and `write` must transfer the full requested range or fail. The
/// optional hooks default to a not-supported status; the kernel sees the
/// corresponding errno in the reply frame.
pub trait Backend {
    fn geometry(&self) -> Geometry;

    /// Fill `buf` from the device, starting at byte `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> BackendResult<()>;

    /// Write `buf` to the device, starting at byte `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> BackendResult<()>;

    /// Called once when the kernel requests an orderly disconnect.
    fn disconnect(&mut self) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }

    /// Flush pending writes to stable storage.
    fn flush(&mut self) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }

    /// Discard a byte range.
    fn trim(&mut self, _offset: u64, _length: u64) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }
}

/// Block-granular storage backend.
///
/// Buffers passed to `read_blocks`/`write_blocks` always span a whole number
/// of blocks; the block count is `buf.len() / block_size`.
pub trait BlockBackend {
    fn geometry(&self) -> Geometry;

    /// Fill `buf` with consecutive whole blocks starting at `block`.
    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> BackendResult<()>;

    /// Write consecutive whole blocks starting at `block`.
    fn write_blocks(&mut self, block: u64, buf: &[u8]) -> BackendResult<()>;

    /// Called once when the kernel requests an orderly disconnect.
    fn disconnect(&mut self) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }

    /// Flush pending writes to stable storage.
    fn flush(&mut self) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }

    /// Discard a byte range.
    fn trim(&mut self, _offset: u64, _length: u64) -> BackendResult<()> {
        Err(BackendError::Unsupported)
    }
}
