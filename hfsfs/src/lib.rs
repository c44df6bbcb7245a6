//! On-disk engine for HFS, HFS+ and HFSX volumes: bit-exact header codecs,
//! B-tree traversal and repair, allocation-bitmap reconciliation, journal
//! replay, a formatter, and a phased consistency checker.
//!
//! Everything operates over a [`device::BlockDevice`] wrapping any
//! `Read + Write + Seek` source, so disk images and `Cursor`-backed test
//! volumes work the same as real block devices.

pub mod error;
pub mod device;
pub mod detect;
pub mod mdb;
pub mod volume;
pub mod bitmap;
pub mod btree;
pub mod unicode;
pub mod extents;
pub mod catalog;
pub mod attributes;
pub mod journal;
pub mod format;
pub mod check;

pub use check::{CheckContext, CheckOptions, CheckSummary, RepairMode};
pub use detect::FsKind;
pub use device::BlockDevice;
pub use error::{HfsError, Result};
pub use mdb::Mdb;
pub use volume::VolumeHeader;

use std::io::{Read, Seek, Write};

/// Variant-independent volume summary.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub kind: FsKind,
    pub name: String,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    /// Seconds since 1904-01-01.
    pub create_date: u32,
    pub modify_date: u32,
    pub journaled: bool,
}

/// Read a volume summary from either an MDB or a Volume Header.
///
/// The HFS+ volume name lives in the catalog, as the name recorded in the
/// root folder's thread record; it is resolved from there, never defaulted.
pub fn read_volume_info<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
) -> Result<VolumeInfo> {
    let kind = detect::probe(dev)?.ok_or(HfsError::NotAFilesystem)?;

    match kind {
        FsKind::Hfs => {
            let mut buf = vec![0u8; 512];
            dev.read_at(1024, &mut buf)?;
            let mdb = Mdb::decode(&buf)?;
            Ok(VolumeInfo {
                kind,
                name: mdb.volume_name.clone(),
                block_size: mdb.alloc_block_size,
                total_blocks: mdb.total_blocks as u32,
                free_blocks: mdb.free_blocks as u32,
                create_date: mdb.create_date,
                modify_date: mdb.modify_date,
                journaled: false,
            })
        }
        FsKind::HfsPlus | FsKind::Hfsx => {
            let vh = volume::read_primary(dev)?;
            let tree = btree::BTree::open(
                dev,
                extents::ForkMap::from_fork(&vh.catalog_file, vh.block_size),
            )?;
            let name = catalog::volume_name(dev, &tree, vh.is_hfsx())?.unwrap_or_else(|| {
                log::warn!("root folder thread record missing; volume has no name");
                String::new()
            });
            Ok(VolumeInfo {
                kind,
                name,
                block_size: vh.block_size,
                total_blocks: vh.total_blocks,
                free_blocks: vh.free_blocks,
                create_date: vh.create_date,
                modify_date: vh.modify_date,
                journaled: vh.is_journaled(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_hfs, format_hfsplus, PlusFormatOptions};
    use std::io::Cursor;

    #[test]
    fn test_volume_info_round_trips_format_parameters() {
        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 4 * 1024 * 1024])).unwrap();
        let mdb = format_hfs(&mut dev, "Archive").unwrap();
        let info = read_volume_info(&mut dev).unwrap();
        assert_eq!(info.kind, FsKind::Hfs);
        assert_eq!(info.name, "Archive");
        assert_eq!(info.block_size, mdb.alloc_block_size);
        assert_eq!(info.total_blocks, mdb.total_blocks as u32);
        assert_eq!(info.free_blocks, mdb.free_blocks as u32);

        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 16 * 1024 * 1024])).unwrap();
        let options = PlusFormatOptions { label: "Backup".into(), ..Default::default() };
        let vh = format_hfsplus(&mut dev, &options).unwrap();
        let info = read_volume_info(&mut dev).unwrap();
        assert_eq!(info.kind, FsKind::HfsPlus);
        assert_eq!(info.name, "Backup");
        assert_eq!(info.block_size, vh.block_size);
        assert_eq!(info.total_blocks, vh.total_blocks);
        assert!(!info.journaled);
    }

    #[test]
    fn test_volume_info_rejects_blank_media() {
        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 1024 * 1024])).unwrap();
        assert!(matches!(
            read_volume_info(&mut dev),
            Err(HfsError::NotAFilesystem)
        ));
    }
}
