//! Extent keys, overflow lookup, and fork-to-device offset mapping.
//!
//! A fork's first extents are inline (eight entries on HFS+, three on HFS);
//! continuations live in the extents-overflow B-tree keyed by
//! (fork type, CNID, start block).

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::io::{Read, Seek, Write};

use crate::btree::BTree;
use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::mdb::HfsExtentRecord;
use crate::volume::{ExtentDescriptor, ForkData};

/// Fork types as stored in extent keys.
pub const FORK_TYPE_DATA: u8 = 0x00;
pub const FORK_TYPE_RESOURCE: u8 = 0xFF;

/// Encoded HFS+ extent key length (excluding the 2-byte length field).
pub const PLUS_EXTENT_KEY_LEN: u16 = 10;

/// Encoded HFS extent key length (excluding the 1-byte length field).
pub const HFS_EXTENT_KEY_LEN: u8 = 7;

/// Maps byte offsets within a fork to absolute device offsets.
///
/// `base_offset` is 0 on HFS+ (blocks count from the volume start) and the
/// allocation-area origin (`drAlBlSt` sectors) on HFS.
#[derive(Debug, Clone)]
pub struct ForkMap {
    extents: Vec<ExtentDescriptor>,
    block_size: u32,
    base_offset: u64,
}

impl ForkMap {
    /// Map an HFS+ fork.
    pub fn from_fork(fork: &ForkData, block_size: u32) -> Self {
        ForkMap {
            extents: fork
                .extents
                .iter()
                .take_while(|e| e.block_count != 0)
                .copied()
                .collect(),
            block_size,
            base_offset: 0,
        }
    }

    /// Map an HFS system-file extent record. Allocation blocks start at
    /// sector `alloc_start`.
    pub fn from_hfs(rec: &HfsExtentRecord, alloc_block_size: u32, alloc_start: u16) -> Self {
        ForkMap {
            extents: rec
                .iter()
                .take_while(|e| e.block_count != 0)
                .map(|e| ExtentDescriptor {
                    start_block: e.start_block as u32,
                    block_count: e.block_count as u32,
                })
                .collect(),
            block_size: alloc_block_size,
            base_offset: alloc_start as u64 * 512,
        }
    }

    /// Map a raw device range (used for the HFS volume bitmap sectors).
    pub fn from_range(offset: u64, len: u64) -> Self {
        ForkMap {
            extents: vec![ExtentDescriptor {
                start_block: 0,
                block_count: (len / 512) as u32,
            }],
            block_size: 512,
            base_offset: offset,
        }
    }

    /// Total bytes covered by the mapped extents.
    pub fn total_bytes(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| e.block_count as u64 * self.block_size as u64)
            .sum()
    }

    /// Translate a fork-relative byte offset to a device offset, along with
    /// the number of contiguous bytes available at that position.
    pub fn translate(&self, offset_in_fork: u64) -> Result<(u64, u64)> {
        let block_size = self.block_size as u64;
        let mut remaining = offset_in_fork;
        for extent in &self.extents {
            let extent_bytes = extent.block_count as u64 * block_size;
            if remaining < extent_bytes {
                let device = self.base_offset + extent.start_block as u64 * block_size + remaining;
                return Ok((device, extent_bytes - remaining));
            }
            remaining -= extent_bytes;
        }
        Err(HfsError::InvalidBTree(format!(
            "fork offset {} exceeds extent capacity",
            offset_in_fork
        )))
    }

    /// Read exactly `buf.len()` bytes at a fork-relative offset, crossing
    /// extent boundaries as needed.
    pub fn read_exact<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        mut offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (device, run) = self.translate(offset)?;
            let take = (buf.len() - done).min(run as usize);
            dev.read_at(device, &mut buf[done..done + take])?;
            done += take;
            offset += take as u64;
        }
        Ok(())
    }

    /// Write all of `buf` at a fork-relative offset.
    pub fn write_all<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        mut offset: u64,
        buf: &[u8],
    ) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (device, run) = self.translate(offset)?;
            let take = (buf.len() - done).min(run as usize);
            dev.write_at(device, &buf[done..done + take])?;
            done += take;
            offset += take as u64;
        }
        Ok(())
    }
}

// ── HFS+ extent keys ─────────────────────────────────────────────────────

/// A decoded extent key, either variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub cnid: u32,
    pub start_block: u32,
}

impl ExtentKey {
    /// Keys order lexicographically on (fork type, CNID, start block).
    pub fn compare(&self, other: &ExtentKey) -> Ordering {
        (self.fork_type, self.cnid, self.start_block).cmp(&(
            other.fork_type,
            other.cnid,
            other.start_block,
        ))
    }
}

/// Parse the key of an HFS+ extents-overflow record.
/// Returns the key and the offset of the record payload.
pub fn parse_plus_extent_key(record: &[u8]) -> Result<(ExtentKey, usize)> {
    if record.len() < 12 {
        return Err(HfsError::InvalidBTree("extent key too short".into()));
    }
    let key_len = BigEndian::read_u16(record);
    if key_len != PLUS_EXTENT_KEY_LEN {
        return Err(HfsError::InvalidBTree(format!(
            "extent key length {} (expected {})",
            key_len, PLUS_EXTENT_KEY_LEN
        )));
    }
    Ok((
        ExtentKey {
            fork_type: record[2],
            cnid: BigEndian::read_u32(&record[4..]),
            start_block: BigEndian::read_u32(&record[8..]),
        },
        12,
    ))
}

/// Encode an HFS+ extent leaf record: key plus eight extent descriptors.
pub fn encode_plus_extent_record(key: &ExtentKey, extents: &[ExtentDescriptor; 8]) -> Vec<u8> {
    let mut out = vec![0u8; 12 + 64];
    BigEndian::write_u16(&mut out[0..], PLUS_EXTENT_KEY_LEN);
    out[2] = key.fork_type;
    BigEndian::write_u32(&mut out[4..], key.cnid);
    BigEndian::write_u32(&mut out[8..], key.start_block);
    for (i, e) in extents.iter().enumerate() {
        BigEndian::write_u32(&mut out[12 + i * 8..], e.start_block);
        BigEndian::write_u32(&mut out[16 + i * 8..], e.block_count);
    }
    out
}

/// Parse the key of an HFS extents-overflow record.
pub fn parse_hfs_extent_key(record: &[u8]) -> Result<(ExtentKey, usize)> {
    if record.len() < 8 {
        return Err(HfsError::InvalidBTree("extent key too short".into()));
    }
    let key_len = record[0];
    if key_len != HFS_EXTENT_KEY_LEN {
        return Err(HfsError::InvalidBTree(format!(
            "extent key length {} (expected {})",
            key_len, HFS_EXTENT_KEY_LEN
        )));
    }
    Ok((
        ExtentKey {
            fork_type: record[1],
            cnid: BigEndian::read_u32(&record[2..]),
            start_block: BigEndian::read_u16(&record[6..]) as u32,
        },
        8,
    ))
}

/// Order two raw HFS+ extent records by key.
pub fn compare_plus_extent_records(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_plus_extent_key(a), parse_plus_extent_key(b)) {
        (Ok((ka, _)), Ok((kb, _))) => ka.compare(&kb),
        // Unparseable keys sort first so the defect is reported once.
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

/// Order two raw HFS extent records by key.
pub fn compare_hfs_extent_records(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_hfs_extent_key(a), parse_hfs_extent_key(b)) {
        (Ok((ka, _)), Ok((kb, _))) => ka.compare(&kb),
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

/// Look up the overflow extent record for (fork type, CNID, start block).
/// Returns the continuation extents, or `None` when the fork has no record
/// at that position.
pub fn lookup_overflow<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    plus: bool,
    target: ExtentKey,
) -> Result<Option<Vec<ExtentDescriptor>>> {
    let compare = |record: &[u8]| -> Ordering {
        let parsed = if plus {
            parse_plus_extent_key(record)
        } else {
            parse_hfs_extent_key(record)
        };
        match parsed {
            Ok((key, _)) => key.compare(&target),
            Err(_) => Ordering::Less,
        }
    };

    let hit = match tree.search(dev, &compare)? {
        Some((node, i)) => node.record(i)?.to_vec(),
        None => return Ok(None),
    };

    let mut extents = Vec::new();
    if plus {
        let (_, payload) = parse_plus_extent_key(&hit)?;
        if hit.len() < payload + 64 {
            return Err(HfsError::InvalidBTree("extent record too short".into()));
        }
        for i in 0..8 {
            extents.push(ExtentDescriptor {
                start_block: BigEndian::read_u32(&hit[payload + i * 8..]),
                block_count: BigEndian::read_u32(&hit[payload + i * 8 + 4..]),
            });
        }
    } else {
        let (_, payload) = parse_hfs_extent_key(&hit)?;
        if hit.len() < payload + 12 {
            return Err(HfsError::InvalidBTree("extent record too short".into()));
        }
        for i in 0..3 {
            extents.push(ExtentDescriptor {
                start_block: BigEndian::read_u16(&hit[payload + i * 4..]) as u32,
                block_count: BigEndian::read_u16(&hit[payload + i * 4 + 2..]) as u32,
            });
        }
    }
    Ok(Some(extents))
}

/// Walk a fork's full extent chain — inline extents, then overflow records —
/// visiting each (start, count) run, until `needed_blocks` are accounted for
/// or the chain ends. Returns the number of blocks found.
pub fn walk_fork_extents<D, F>(
    dev: &mut BlockDevice<D>,
    extents_tree: &BTree,
    plus: bool,
    cnid: u32,
    fork_type: u8,
    inline: &[ExtentDescriptor],
    needed_blocks: u64,
    mut visit: F,
) -> Result<u64>
where
    D: Read + Write + Seek,
    F: FnMut(u32, u32),
{
    let mut found: u64 = 0;
    for extent in inline.iter().take_while(|e| e.block_count != 0) {
        visit(extent.start_block, extent.block_count);
        found += extent.block_count as u64;
    }

    // Overflow chains are bounded; a fork needing more than this many
    // records is corrupt.
    let mut rounds = 0;
    while found < needed_blocks {
        rounds += 1;
        if rounds > 1024 {
            return Err(HfsError::InvalidBTree(format!(
                "extent chain for CNID {} does not terminate",
                cnid
            )));
        }
        let key = ExtentKey {
            fork_type,
            cnid,
            start_block: found as u32,
        };
        let Some(continuation) = lookup_overflow(dev, extents_tree, plus, key)? else {
            break;
        };
        let mut any = false;
        for extent in continuation.iter().take_while(|e| e.block_count != 0) {
            visit(extent.start_block, extent.block_count);
            found += extent.block_count as u64;
            any = true;
        }
        if !any {
            break;
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fork_map_translation() {
        let fork = ForkData {
            logical_size: 3 * 4096,
            clump_size: 4096,
            total_blocks: 3,
            extents: {
                let mut e = [ExtentDescriptor::default(); 8];
                e[0] = ExtentDescriptor { start_block: 10, block_count: 2 };
                e[1] = ExtentDescriptor { start_block: 50, block_count: 1 };
                e
            },
        };
        let map = ForkMap::from_fork(&fork, 4096);
        assert_eq!(map.total_bytes(), 3 * 4096);

        // Inside the first extent.
        let (dev_off, run) = map.translate(4096 + 100).unwrap();
        assert_eq!(dev_off, 11 * 4096 + 100);
        assert_eq!(run, 4096 - 100);

        // Spilling into the second extent.
        let (dev_off, _) = map.translate(2 * 4096).unwrap();
        assert_eq!(dev_off, 50 * 4096);

        assert!(map.translate(3 * 4096).is_err());
    }

    #[test]
    fn test_hfs_fork_map_uses_allocation_origin() {
        let rec: HfsExtentRecord = [
            crate::mdb::HfsExtent { start_block: 0, block_count: 2 },
            crate::mdb::HfsExtent::default(),
            crate::mdb::HfsExtent::default(),
        ];
        // Allocation area begins at sector 5: block 0 is at byte 2560.
        let map = ForkMap::from_hfs(&rec, 512, 5);
        let (dev_off, _) = map.translate(0).unwrap();
        assert_eq!(dev_off, 5 * 512);
    }

    #[test]
    fn test_read_across_extent_boundary() {
        let mut backing = vec![0u8; 64 * 512];
        backing[20 * 512 + 511] = 0xAA; // last byte of extent one
        backing[40 * 512] = 0xBB; // first byte of extent two
        let mut dev = BlockDevice::new(Cursor::new(backing)).unwrap();

        let fork = ForkData {
            logical_size: 1024,
            clump_size: 512,
            total_blocks: 2,
            extents: {
                let mut e = [ExtentDescriptor::default(); 8];
                e[0] = ExtentDescriptor { start_block: 20, block_count: 1 };
                e[1] = ExtentDescriptor { start_block: 40, block_count: 1 };
                e
            },
        };
        let map = ForkMap::from_fork(&fork, 512);
        let mut buf = [0u8; 2];
        map.read_exact(&mut dev, 511, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }

    #[test]
    fn test_plus_extent_key_roundtrip() {
        let key = ExtentKey { fork_type: FORK_TYPE_DATA, cnid: 31, start_block: 8 };
        let record = encode_plus_extent_record(&key, &[ExtentDescriptor::default(); 8]);
        let (back, payload) = parse_plus_extent_key(&record).unwrap();
        assert_eq!(back, key);
        assert_eq!(payload, 12);
    }

    #[test]
    fn test_extent_key_ordering() {
        let a = ExtentKey { fork_type: 0, cnid: 10, start_block: 0 };
        let b = ExtentKey { fork_type: 0, cnid: 10, start_block: 16 };
        let c = ExtentKey { fork_type: 0, cnid: 11, start_block: 0 };
        let d = ExtentKey { fork_type: 0xFF, cnid: 5, start_block: 0 };
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&c), Ordering::Less);
        // Fork type dominates CNID.
        assert_eq!(c.compare(&d), Ordering::Less);
    }
}
