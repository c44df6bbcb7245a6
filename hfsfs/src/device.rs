//! Sector-aligned block I/O over a seekable byte device.
//!
//! Every multi-byte field on an HFS/HFS+ volume is big-endian; callers decode
//! loaded buffers with explicit `byteorder` accessors rather than casting.
//! Reads and writes are aligned to 512-byte sectors at the device boundary;
//! larger allocation blocks are composed from sectors.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use crate::error::{HfsError, Result};

/// Device sector size. Fixed for both HFS and HFS+.
pub const SECTOR_SIZE: u64 = 512;

/// Number of cached sectors. The cache is write-through: a write goes to the
/// device first and evicts any overlapping entry.
const CACHE_SECTORS: usize = 32;

struct CachedSector {
    sector: u64,
    data: [u8; SECTOR_SIZE as usize],
    /// Monotonic access stamp for LRU eviction.
    stamp: u64,
}

/// A block device over any `Read + Write + Seek` source.
///
/// The checker disables caching so every read hits the medium and bad sectors
/// surface instead of being masked by a stale entry.
pub struct BlockDevice<D> {
    inner: D,
    size: u64,
    cache: Vec<CachedSector>,
    caching: bool,
    clock: u64,
}

impl<D: Read + Write + Seek> BlockDevice<D> {
    /// Wrap a device, measuring its size. Caching is enabled by default.
    pub fn new(mut inner: D) -> Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(BlockDevice {
            inner,
            size,
            cache: Vec::with_capacity(CACHE_SECTORS),
            caching: true,
            clock: 0,
        })
    }

    /// Wrap a device with the sector cache disabled.
    pub fn without_cache(inner: D) -> Result<Self> {
        let mut dev = Self::new(inner)?;
        dev.set_caching(false);
        Ok(dev)
    }

    /// Enable or disable the sector cache. Disabling drops all entries.
    pub fn set_caching(&mut self, on: bool) {
        self.caching = on;
        if !on {
            self.cache.clear();
        }
    }

    /// Total device size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read `buf.len()` bytes at an absolute byte offset.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(HfsError::ShortRead(offset));
        }
        if !self.caching {
            return self.read_raw(offset, buf);
        }

        // Serve through whole-sector cache entries.
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector = pos / SECTOR_SIZE;
            let within = (pos % SECTOR_SIZE) as usize;
            let take = buf.len() - done;
            let take = take.min(SECTOR_SIZE as usize - within);

            let data = self.sector_data(sector)?;
            buf[done..done + take].copy_from_slice(&data[within..within + take]);
            done += take;
        }
        Ok(())
    }

    /// Write `buf` at an absolute byte offset. Write-through: the device is
    /// written first and overlapping cache entries are evicted.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(HfsError::ShortRead(offset));
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(buf)?;

        let first = offset / SECTOR_SIZE;
        let last = (offset + buf.len() as u64 - 1) / SECTOR_SIZE;
        self.cache.retain(|c| c.sector < first || c.sector > last);
        Ok(())
    }

    /// Read one allocation block of `block_size` bytes.
    pub fn read_block(&mut self, block: u64, block_size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; block_size as usize];
        self.read_at(block * block_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one allocation block of `block_size` bytes.
    pub fn write_block(&mut self, block: u64, block_size: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), block_size as usize);
        self.write_at(block * block_size as u64, data)
    }

    /// Flush buffered writes to the medium. Must complete before any repair
    /// or format operation reports success.
    pub fn sync(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Consume the wrapper and return the underlying device.
    pub fn into_inner(self) -> D {
        self.inner
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                HfsError::ShortRead(offset)
            } else {
                HfsError::Io(e)
            }
        })
    }

    fn sector_data(&mut self, sector: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(hit) = self.cache.iter_mut().find(|c| c.sector == sector) {
            hit.stamp = stamp;
            return Ok(hit.data);
        }

        let mut data = [0u8; SECTOR_SIZE as usize];
        self.read_raw(sector * SECTOR_SIZE, &mut data)?;

        if self.cache.len() >= CACHE_SECTORS {
            let victim = self
                .cache
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.stamp)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.cache.swap_remove(victim);
        }
        self.cache.push(CachedSector { sector, data, stamp });
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn device(len: usize) -> BlockDevice<Cursor<Vec<u8>>> {
        BlockDevice::new(Cursor::new(vec![0u8; len])).unwrap()
    }

    #[test]
    fn test_size_and_roundtrip() {
        let mut dev = device(4096);
        assert_eq!(dev.size(), 4096);

        dev.write_at(1000, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_past_end_is_short_read() {
        let mut dev = device(1024);
        let mut buf = [0u8; 16];
        assert!(matches!(
            dev.read_at(1020, &mut buf),
            Err(HfsError::ShortRead(1020))
        ));
    }

    #[test]
    fn test_write_invalidates_cached_sector() {
        let mut dev = device(2048);
        let mut buf = [0u8; 4];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);

        // Cross-sector write must evict both cached sectors.
        dev.write_at(510, &[1, 2, 3, 4]).unwrap();
        dev.read_at(510, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_uncached_reads() {
        let mut dev = BlockDevice::without_cache(Cursor::new(vec![7u8; 1024])).unwrap();
        let mut buf = [0u8; 3];
        dev.read_at(700, &mut buf).unwrap();
        assert_eq!(buf, [7, 7, 7]);
    }

    #[test]
    fn test_cache_eviction_keeps_contents_correct() {
        let mut dev = device(64 * 512);
        for s in 0..64u64 {
            dev.write_at(s * 512, &[s as u8]).unwrap();
        }
        // Touch more sectors than the cache holds, then re-read them all.
        for s in 0..64u64 {
            let mut b = [0u8; 1];
            dev.read_at(s * 512, &mut b).unwrap();
            assert_eq!(b[0], s as u8);
        }
    }
}
