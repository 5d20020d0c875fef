//! Byte-addressable adapter over block-granular backends.
//!
//! Backends that only understand whole blocks get byte addressing through
//! read-modify-write: an unaligned write first reads the partially covered
//! edge blocks, splices the caller's bytes over them, and writes the whole
//! covered range back; an unaligned read fetches the covered range and copies
//! out the requested sub-slice.

use crate::backend::{Backend, BackendResult, BlockBackend};
use crate::types::Geometry;

/// Wraps a [`BlockBackend`] and exposes byte-addressable I/O.
pub struct BlockAligned<B> {
    inner: B,
}

impl<B: BlockBackend> BlockAligned<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: BlockBackend> Backend for BlockAligned<B> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> BackendResult<()> {
        let block_size = self.inner.geometry().block_size;
        let len = buf.len() as u64;

        if offset % block_size == 0 && len % block_size == 0 {
            return self.inner.read_blocks(offset / block_size, buf);
        }

        let gap = offset % block_size;
        let first = offset / block_size;
        let blocks = (gap + len).div_ceil(block_size);

        let mut scratch = vec![0u8; (blocks * block_size) as usize];
        self.inner.read_blocks(first, &mut scratch)?;
        buf.copy_from_slice(&scratch[gap as usize..(gap + len) as usize]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> BackendResult<()> {
        let block_size = self.inner.geometry().block_size;
        let len = buf.len() as u64;

        if offset % block_size == 0 && len % block_size == 0 {
            return self.inner.write_blocks(offset / block_size, buf);
        }

        let gap = offset % block_size;
        let first = offset / block_size;
        let end = offset + len;
        let blocks = (gap + len).div_ceil(block_size);
        let last = first + blocks - 1;
        let block_bytes = block_size as usize;

        let mut scratch = vec![0u8; blocks as usize * block_bytes];
        if gap != 0 {
            // preserve the leading block's bytes before `offset`
            self.inner.read_blocks(first, &mut scratch[..block_bytes])?;
        }
        // The last covered block keeps its bytes past the request's end,
        // unless it is the leading block and was already fetched.
        if end % block_size != 0 && (last != first || gap == 0) {
            let tail = (blocks as usize - 1) * block_bytes;
            self.inner.read_blocks(last, &mut scratch[tail..])?;
        }
        scratch[gap as usize..(gap + len) as usize].copy_from_slice(buf);
        self.inner.write_blocks(first, &scratch)
    }

    fn disconnect(&mut self) -> BackendResult<()> {
        self.inner.disconnect()
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.inner.flush()
    }

    fn trim(&mut self, offset: u64, length: u64) -> BackendResult<()> {
        self.inner.trim(offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory block disk initialized to `.` bytes, counting backend calls.
    struct DotDisk {
        geometry: Geometry,
        data: Vec<u8>,
        reads: usize,
        writes: usize,
    }

    impl DotDisk {
        fn new(block_size: u64, block_count: u64) -> Self {
            Self {
                geometry: Geometry::new(block_size, block_count),
                data: vec![b'.'; (block_size * block_count) as usize],
                reads: 0,
                writes: 0,
            }
        }
    }

    impl BlockBackend for DotDisk {
        fn geometry(&self) -> Geometry {
            self.geometry
        }

        fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> BackendResult<()> {
            self.reads += 1;
            let start = (block * self.geometry.block_size) as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        fn write_blocks(&mut self, block: u64, buf: &[u8]) -> BackendResult<()> {
            self.writes += 1;
            let start = (block * self.geometry.block_size) as usize;
            self.data[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn dot_device() -> BlockAligned<DotDisk> {
        BlockAligned::new(DotDisk::new(8, 8))
    }

    fn contents(device: &BlockAligned<DotDisk>) -> &str {
        std::str::from_utf8(&device.get_ref().data).unwrap()
    }

    #[test]
    fn unaligned_writes_merge_partial_blocks() {
        let mut device = dot_device();
        assert_eq!(
            contents(&device),
            concat!(
                "........", "........", "........", "........",
                "........", "........", "........", "........",
            )
        );

        device.write(0, b"11111111").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "........", "........", "........",
                "........", "........", "........", "........",
            )
        );

        device.write(12, b"22222222").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "2222....", "........",
                "........", "........", "........", "........",
            )
        );

        device.write(20, b"3333333333333333").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "22223333", "33333333",
                "3333....", "........", "........", "........",
            )
        );

        device.write(25, b"4444").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "22223333", "34444333",
                "3333....", "........", "........", "........",
            )
        );

        device.write(32, b"555555555").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "22223333", "34444333",
                "55555555", "5.......", "........", "........",
            )
        );

        device.write(39, b"666666666").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "22223333", "34444333",
                "55555556", "66666666", "........", "........",
            )
        );

        device.write(47, b"77777777777777777").unwrap();
        assert_eq!(
            contents(&device),
            concat!(
                "11111111", "....2222", "22223333", "34444333",
                "55555556", "66666667", "77777777", "77777777",
            )
        );
    }

    #[test]
    fn aligned_io_takes_the_fast_path() {
        let mut device = dot_device();

        device.write(8, b"aaaaaaaabbbbbbbb").unwrap();
        assert_eq!(device.get_ref().writes, 1);
        assert_eq!(device.get_ref().reads, 0);

        let mut buf = [0u8; 16];
        device.read(8, &mut buf).unwrap();
        assert_eq!(device.get_ref().reads, 1);
        assert_eq!(&buf, b"aaaaaaaabbbbbbbb");
    }

    #[test]
    fn interior_write_reads_the_block_once() {
        // Request entirely inside one block, shorter than the remainder after
        // the gap: the leading read already covers the trailing remainder.
        let mut device = dot_device();
        device.write(1, b"xyz").unwrap();
        assert_eq!(device.get_ref().reads, 1);
        assert_eq!(device.get_ref().writes, 1);
        assert_eq!(&contents(&device)[..8], ".xyz....");
    }

    #[test]
    fn aligned_offset_with_short_length_reads_trailing_block() {
        let mut device = dot_device();
        device.write(16, b"abc").unwrap();
        assert_eq!(device.get_ref().reads, 1);
        assert_eq!(&contents(&device)[16..24], "abc.....");
    }

    #[test]
    fn unaligned_write_preserves_bytes_outside_the_range() {
        let mut device = dot_device();
        device.write(8, b"ABCDEFGH").unwrap();
        device.write(10, b"zz").unwrap();
        assert_eq!(&contents(&device)[8..16], "ABzzEFGH");
    }

    #[test]
    fn unaligned_roundtrip() {
        let mut device = dot_device();
        for &(offset, payload) in &[
            (3u64, &b"hello"[..]),
            (13, &b"spanning!"[..]),
            (30, &b"0123456789abcdef"[..]),
        ] {
            device.write(offset, payload).unwrap();
            let mut back = vec![0u8; payload.len()];
            device.read(offset, &mut back).unwrap();
            assert_eq!(back, payload, "roundtrip at offset {offset}");
        }
    }

    #[test]
    fn unaligned_read_returns_only_the_requested_range() {
        let mut device = dot_device();
        device.write(0, b"11111111").unwrap();
        device.write(12, b"22222222").unwrap();

        let mut buf = [0u8; 12];
        device.read(6, &mut buf).unwrap();
        assert_eq!(&buf, b"11....222222");
    }

    #[test]
    fn hooks_pass_through_to_the_inner_backend() {
        let mut device = dot_device();
        assert!(matches!(
            device.flush(),
            Err(crate::error::BackendError::Unsupported)
        ));
        assert!(matches!(
            device.trim(0, 8),
            Err(crate::error::BackendError::Unsupported)
        ));
    }
}
