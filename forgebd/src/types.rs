//! Core types for forgebd.

use serde::{Deserialize, Serialize};

use crate::error::GeometryError;

/// Device geometry: fixed block size and total block count.
///
/// Every I/O offset/length pair served by the device must lie within
/// `[0, block_size * block_count)`; the backend contract assumes the kernel
/// keeps requests in bounds once the geometry has been configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Block size in bytes.
    pub block_size: u64,
    /// Device size as a count of blocks.
    pub block_count: u64,
}

impl Geometry {
    pub fn new(block_size: u64, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.block_size == 0 {
            return Err(GeometryError::InvalidValue {
                field: "block_size",
                reason: "must be > 0",
            });
        }
        if self.block_count == 0 {
            return Err(GeometryError::InvalidValue {
                field: "block_count",
                reason: "must be > 0",
            });
        }
        if self.block_size.checked_mul(self.block_count).is_none() {
            return Err(GeometryError::InvalidValue {
                field: "block_count",
                reason: "device size overflows u64",
            });
        }
        Ok(())
    }

    /// Total device size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.block_size * self.block_count
    }
}
