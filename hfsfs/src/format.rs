//! Volume formatter: lays out a fresh HFS or HFS+ volume bit by bit.
//!
//! Write order is fixed: boot blocks, primary header, allocation bitmap,
//! system B-tree files, alternate header at `device_size - 1024`, final
//! sync. Every timestamp written is Y2K40-clamped.

use std::io::{Read, Seek, Write};

use crate::btree::{
    self, HeaderRecord, KEY_COMPARE_BINARY, KEY_COMPARE_CASE_FOLD, TREE_TYPE_ATTRIBUTES,
    TREE_TYPE_CATALOG, TREE_TYPE_EXTENTS,
};
use crate::bitmap::Bitmap;
use crate::catalog::{
    self, CatalogFolder, HfsCatalogDir, CNID_FIRST_USER, CNID_ROOT_FOLDER, CNID_ROOT_PARENT,
};
use crate::detect::now_hfs;
use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::extents::ForkMap;
use crate::journal;
use crate::mdb::{Mdb, HfsExtent, HFS_MAX_BLOCKS, HFS_MAX_NAME_LEN, HFS_SIGNATURE};
use crate::unicode;
use crate::volume::{
    self, ExtentDescriptor, ForkData, VolumeHeader, ATTR_JOURNALED, ATTR_UNMOUNTED,
    HFSX_SIGNATURE, HFS_PLUS_SIGNATURE, HFS_PLUS_VERSION,
};

/// Boot-block sentinel at offset 0 ("LK").
pub const BOOT_SIGNATURE: [u8; 2] = [0x4C, 0x4B];

/// Node size used for all HFS+ system B-trees.
const PLUS_NODE_SIZE: u32 = 4096;

/// HFS B-tree node size.
const HFS_NODE_SIZE: u32 = 512;

/// Maximum encoded HFS catalog key length.
const HFS_MAX_CATALOG_KEY: u16 = 37;

/// Maximum encoded HFS+ catalog key length (6 + 2 * 255).
const PLUS_MAX_CATALOG_KEY: u16 = 516;

/// Maximum encoded HFS+ attribute key length.
const PLUS_MAX_ATTR_KEY: u16 = 266;

// B-tree header attribute bits.
const BT_BIG_KEYS: u32 = 2;
const BT_VARIABLE_INDEX_KEYS: u32 = 4;

/// Options for formatting an HFS+ volume.
#[derive(Debug, Clone)]
pub struct PlusFormatOptions {
    pub label: String,
    pub journaled: bool,
    pub case_sensitive: bool,
}

impl Default for PlusFormatOptions {
    fn default() -> Self {
        PlusFormatOptions {
            label: "Untitled".into(),
            journaled: false,
            case_sensitive: false,
        }
    }
}

/// Validate a volume label: 1..=27 bytes for HFS, 1..=255 UTF-16 units for
/// HFS+; `:` and NUL are rejected for both.
pub fn validate_label(label: &str, plus: bool) -> Result<()> {
    let len = if plus {
        label.encode_utf16().count()
    } else {
        label.len()
    };
    let max = if plus { 255 } else { HFS_MAX_NAME_LEN };
    if len == 0 || len > max {
        return Err(HfsError::InvalidName(format!(
            "volume name must be 1-{} characters long",
            max
        )));
    }
    if label.contains(':') || label.contains('\0') {
        return Err(HfsError::InvalidName(
            "volume name cannot contain ':' or null characters".into(),
        ));
    }
    Ok(())
}

fn write_boot_blocks<D: Read + Write + Seek>(dev: &mut BlockDevice<D>) -> Result<()> {
    let mut boot = vec![0u8; 1024];
    boot[..2].copy_from_slice(&BOOT_SIGNATURE);
    dev.write_at(0, &boot)
}

// ── HFS ──────────────────────────────────────────────────────────────────

/// Computed geometry for a classic HFS volume.
#[derive(Debug, Clone)]
struct HfsGeometry {
    alloc_block_size: u32,
    total_blocks: u16,
    bitmap_sectors: u32,
    /// First sector of the allocation area.
    alloc_start: u16,
    extents_blocks: u16,
    catalog_blocks: u16,
}

fn hfs_geometry(device_size: u64) -> Result<HfsGeometry> {
    if device_size < 800 * 1024 {
        return Err(HfsError::DeviceTooSmall(device_size));
    }

    // Block size scales so the 16-bit block count can span the device,
    // rounded up to the next power of two >= 512.
    let raw = device_size / (HFS_MAX_BLOCKS as u64 + 1);
    let alloc_block_size = raw.next_power_of_two().max(512) as u32;

    let approx_blocks = device_size / alloc_block_size as u64;
    let bitmap_bytes = (approx_blocks + 7) / 8;
    let bitmap_sectors = ((bitmap_bytes + 511) / 512) as u32;
    let alloc_start = 3 + bitmap_sectors;

    // Reserved tail: alternate MDB plus the final sector.
    let usable = device_size
        .saturating_sub(alloc_start as u64 * 512)
        .saturating_sub(1024);
    let total_blocks = (usable / alloc_block_size as u64).min(HFS_MAX_BLOCKS as u64) as u16;
    if total_blocks < 16 {
        return Err(HfsError::DeviceTooSmall(device_size));
    }

    let catalog_blocks = if total_blocks > 250 {
        (total_blocks / 250).max(4)
    } else {
        4
    };

    Ok(HfsGeometry {
        alloc_block_size,
        total_blocks,
        bitmap_sectors,
        alloc_start: alloc_start as u16,
        extents_blocks: 1,
        catalog_blocks,
    })
}

/// Format a classic HFS volume with the given label. Returns the MDB as
/// written.
pub fn format_hfs<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    label: &str,
) -> Result<Mdb> {
    validate_label(label, false)?;
    let geometry = hfs_geometry(dev.size())?;
    let now = now_hfs();

    let g = &geometry;
    let absize = g.alloc_block_size;
    let extents_extents = [
        HfsExtent { start_block: 0, block_count: g.extents_blocks },
        HfsExtent::default(),
        HfsExtent::default(),
    ];
    let catalog_extents = [
        HfsExtent { start_block: g.extents_blocks, block_count: g.catalog_blocks },
        HfsExtent::default(),
        HfsExtent::default(),
    ];
    let system_blocks = g.extents_blocks + g.catalog_blocks;

    let mdb = Mdb {
        signature: HFS_SIGNATURE,
        create_date: now,
        modify_date: now,
        attributes: 0x0100, // unmounted cleanly
        root_file_count: 0,
        bitmap_start: 3,
        alloc_ptr: system_blocks,
        total_blocks: g.total_blocks,
        alloc_block_size: absize,
        clump_size: absize * 4,
        alloc_start: g.alloc_start,
        next_cnid: CNID_FIRST_USER,
        free_blocks: g.total_blocks - system_blocks,
        volume_name: label.to_string(),
        backup_date: 0,
        backup_seq: 0,
        write_count: 0,
        extents_clump_size: absize * 4,
        catalog_clump_size: absize * 4,
        root_dir_count: 0,
        file_count: 0,
        folder_count: 1, // the root directory counts on HFS
        finder_info: [0; 8],
        embed_signature: 0,
        embed_extent: HfsExtent::default(),
        extents_file_size: g.extents_blocks as u32 * absize,
        extents_file_extents: extents_extents,
        catalog_file_size: g.catalog_blocks as u32 * absize,
        catalog_file_extents: catalog_extents,
    };

    write_boot_blocks(dev)?;

    let mut mdb_sector = vec![0u8; 512];
    mdb.encode(&mut mdb_sector);
    dev.write_at(1024, &mdb_sector)?;

    // Bitmap: system-file blocks are used, everything else free.
    let mut bitmap = Bitmap::new(g.total_blocks as u32);
    for b in 0..system_blocks as u32 {
        bitmap.set(b);
    }
    let mut bitmap_area = vec![0u8; g.bitmap_sectors as usize * 512];
    bitmap_area[..bitmap.as_bytes().len()].copy_from_slice(bitmap.as_bytes());
    dev.write_at(3 * 512, &bitmap_area)?;

    // Extents overflow tree: a lone header node.
    let extents_nodes = mdb.extents_file_size / HFS_NODE_SIZE;
    let extents_header = HeaderRecord {
        tree_depth: 0,
        root_node: 0,
        leaf_records: 0,
        first_leaf_node: 0,
        last_leaf_node: 0,
        node_size: HFS_NODE_SIZE as u16,
        max_key_length: 7,
        total_nodes: extents_nodes,
        free_nodes: extents_nodes - 1,
        clump_size: mdb.extents_clump_size,
        tree_type: TREE_TYPE_EXTENTS,
        key_compare_type: 0,
        attributes: 0,
    };
    let extents_map = ForkMap::from_hfs(&mdb.extents_file_extents, absize, g.alloc_start);
    extents_map.write_all(dev, 0, &vec![0u8; mdb.extents_file_size as usize])?;
    extents_map.write_all(dev, 0, &btree::build_header_node(&extents_header, &[0]))?;

    // Catalog tree: header node plus one leaf holding the root directory
    // record and its thread.
    let catalog_nodes = mdb.catalog_file_size / HFS_NODE_SIZE;
    let catalog_header = HeaderRecord {
        tree_depth: 1,
        root_node: 1,
        leaf_records: 2,
        first_leaf_node: 1,
        last_leaf_node: 1,
        node_size: HFS_NODE_SIZE as u16,
        max_key_length: HFS_MAX_CATALOG_KEY,
        total_nodes: catalog_nodes,
        free_nodes: catalog_nodes - 2,
        clump_size: mdb.catalog_clump_size,
        tree_type: TREE_TYPE_CATALOG,
        key_compare_type: 0,
        attributes: 0,
    };

    let root_dir = HfsCatalogDir {
        flags: 0,
        valence: 0,
        dir_id: CNID_ROOT_FOLDER,
        create_date: now,
        modify_date: now,
        backup_date: 0,
    };
    let mut dir_record = catalog::encode_hfs_catalog_key(CNID_ROOT_PARENT, label.as_bytes());
    dir_record.extend_from_slice(&catalog::encode_hfs_dir_record(&root_dir));
    let mut thread_record = catalog::encode_hfs_catalog_key(CNID_ROOT_FOLDER, b"");
    thread_record.extend_from_slice(&catalog::encode_hfs_thread_record(
        true,
        CNID_ROOT_PARENT,
        label.as_bytes(),
    ));

    let catalog_map = ForkMap::from_hfs(&mdb.catalog_file_extents, absize, g.alloc_start);
    catalog_map.write_all(dev, 0, &vec![0u8; mdb.catalog_file_size as usize])?;
    catalog_map.write_all(dev, 0, &btree::build_header_node(&catalog_header, &[0, 1]))?;
    catalog_map.write_all(
        dev,
        HFS_NODE_SIZE as u64,
        &btree::build_leaf_node(HFS_NODE_SIZE as usize, 0, 0, &[dir_record, thread_record]),
    )?;

    // Alternate MDB, then sync.
    dev.write_at(dev.size() - 1024, &mdb_sector)?;
    dev.sync()?;

    log::info!(
        "formatted HFS volume '{}': {} blocks of {} bytes",
        label,
        mdb.total_blocks,
        mdb.alloc_block_size
    );
    Ok(mdb)
}

// ── HFS+ ─────────────────────────────────────────────────────────────────

/// Computed geometry for an HFS+ volume.
#[derive(Debug, Clone)]
struct PlusGeometry {
    block_size: u32,
    total_blocks: u32,
    allocation: (u32, u32), // (start block, block count)
    extents: (u32, u32),
    catalog: (u32, u32),
    attributes: (u32, u32),
    /// (info block, journal start block, journal block count)
    journal: Option<(u32, u32, u32)>,
    next_allocation: u32,
}

fn plus_geometry(device_size: u64, journaled: bool) -> Result<PlusGeometry> {
    if device_size < 1024 * 1024 {
        return Err(HfsError::DeviceTooSmall(device_size));
    }

    let block_size: u32 = if device_size > 1024 * 1024 * 1024 { 4096 } else { 512 };
    let total_blocks = (device_size / block_size as u64) as u32;

    let blocks_of = |bytes: u64| -> u32 { ((bytes + block_size as u64 - 1) / block_size as u64) as u32 };

    // Allocation file: one bit per block, rounded up to a whole block.
    let alloc_blocks = blocks_of(((total_blocks as u64) + 7) / 8);

    // Catalog: at least four 4096-byte nodes, scaled up on big volumes.
    let mut catalog_bytes = 4 * PLUS_NODE_SIZE as u64;
    if total_blocks > 10_000 {
        catalog_bytes = catalog_bytes.max(block_size as u64 * (total_blocks as u64 / 2500));
    }
    // Whole nodes and whole blocks.
    catalog_bytes = round_up(catalog_bytes, PLUS_NODE_SIZE as u64);
    catalog_bytes = round_up(catalog_bytes, block_size as u64);
    let catalog_blocks = blocks_of(catalog_bytes);

    let extents_blocks = blocks_of(PLUS_NODE_SIZE as u64);
    let attributes_blocks = blocks_of(PLUS_NODE_SIZE as u64);

    // Front reservation covers the boot blocks and the volume header.
    let front = blocks_of(1536);
    let mut next = front;
    let allocation = (next, alloc_blocks);
    next += alloc_blocks;
    let extents = (next, extents_blocks);
    next += extents_blocks;
    let catalog = (next, catalog_blocks);
    next += catalog_blocks;
    let attributes = (next, attributes_blocks);
    next += attributes_blocks;

    let journal = if journaled {
        let bytes = (device_size / 100).clamp(512 * 1024, 8 * 1024 * 1024);
        let journal_blocks = blocks_of(bytes);
        let triple = (next, next + 1, journal_blocks);
        next += 1 + journal_blocks;
        Some(triple)
    } else {
        None
    };

    // Tail reservation: the blocks holding the alternate header.
    let tail_start = ((device_size - 1024) / block_size as u64) as u32;
    if next >= tail_start {
        return Err(HfsError::DeviceTooSmall(device_size));
    }

    Ok(PlusGeometry {
        block_size,
        total_blocks,
        allocation,
        extents,
        catalog,
        attributes,
        journal,
        next_allocation: next,
    })
}

fn round_up(value: u64, to: u64) -> u64 {
    (value + to - 1) / to * to
}

fn fork_for(start: u32, blocks: u32, block_size: u32, clump: u32) -> ForkData {
    let mut extents = [ExtentDescriptor::default(); 8];
    extents[0] = ExtentDescriptor { start_block: start, block_count: blocks };
    ForkData {
        logical_size: blocks as u64 * block_size as u64,
        clump_size: clump,
        total_blocks: blocks,
        extents,
    }
}

/// Format an HFS+ (or HFSX) volume. Returns the volume header as written.
pub fn format_hfsplus<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    options: &PlusFormatOptions,
) -> Result<VolumeHeader> {
    validate_label(&options.label, true)?;
    let g = plus_geometry(dev.size(), options.journaled)?;
    let now = now_hfs();
    let bs = g.block_size;

    let mut vh = VolumeHeader {
        signature: if options.case_sensitive { HFSX_SIGNATURE } else { HFS_PLUS_SIGNATURE },
        version: HFS_PLUS_VERSION,
        attributes: ATTR_UNMOUNTED
            | if options.journaled { ATTR_JOURNALED } else { 0 },
        last_mounted_version: if options.journaled { 0x4846_534A } else { 0x3130_2E30 },
        journal_info_block: g.journal.map(|(jib, _, _)| jib).unwrap_or(0),
        create_date: now,
        modify_date: now,
        backup_date: 0,
        checked_date: now,
        file_count: 0,
        folder_count: 0, // the root folder is not counted on HFS+
        block_size: bs,
        total_blocks: g.total_blocks,
        free_blocks: 0, // filled in below from the bitmap
        next_allocation: g.next_allocation,
        rsrc_clump_size: 65_536.max(bs),
        data_clump_size: 65_536.max(bs),
        next_catalog_id: CNID_FIRST_USER,
        write_count: 0,
        encodings_bitmap: 1,
        finder_info: [0; 8],
        allocation_file: fork_for(g.allocation.0, g.allocation.1, bs, bs * 4),
        extents_file: fork_for(g.extents.0, g.extents.1, bs, bs * 4),
        catalog_file: fork_for(g.catalog.0, g.catalog.1, bs, bs * 4),
        attributes_file: fork_for(g.attributes.0, g.attributes.1, bs, bs * 4),
        startup_file: ForkData::default(),
    };

    // Mark every system block used in the allocation bitmap.
    let mut bitmap = Bitmap::new(g.total_blocks);
    let mut mark = |start: u32, count: u32| {
        for b in start..start + count {
            bitmap.set(b);
        }
    };
    mark(0, g.allocation.0); // boot blocks + volume header
    mark(g.allocation.0, g.allocation.1);
    mark(g.extents.0, g.extents.1);
    mark(g.catalog.0, g.catalog.1);
    mark(g.attributes.0, g.attributes.1);
    if let Some((jib, jstart, jblocks)) = g.journal {
        mark(jib, 1);
        mark(jstart, jblocks);
    }
    let tail_start = ((dev.size() - 1024) / bs as u64) as u32;
    mark(tail_start, g.total_blocks - tail_start);
    vh.free_blocks = bitmap.count_free();

    write_boot_blocks(dev)?;
    volume::write_both(dev, &vh)?;

    // Allocation file contents: the bitmap, zero-padded to the file size.
    let alloc_map = ForkMap::from_fork(&vh.allocation_file, bs);
    let mut alloc_bytes = vec![0u8; vh.allocation_file.logical_size as usize];
    alloc_bytes[..bitmap.as_bytes().len()].copy_from_slice(bitmap.as_bytes());
    alloc_map.write_all(dev, 0, &alloc_bytes)?;

    // Catalog: header node plus a leaf with the root folder and its thread.
    let label_units = unicode::string_to_units(&options.label);
    let catalog_nodes = (vh.catalog_file.logical_size / PLUS_NODE_SIZE as u64) as u32;
    let catalog_header = HeaderRecord {
        tree_depth: 1,
        root_node: 1,
        leaf_records: 2,
        first_leaf_node: 1,
        last_leaf_node: 1,
        node_size: PLUS_NODE_SIZE as u16,
        max_key_length: PLUS_MAX_CATALOG_KEY,
        total_nodes: catalog_nodes,
        free_nodes: catalog_nodes - 2,
        clump_size: vh.catalog_file.clump_size,
        tree_type: TREE_TYPE_CATALOG,
        key_compare_type: if options.case_sensitive {
            KEY_COMPARE_BINARY
        } else {
            KEY_COMPARE_CASE_FOLD
        },
        attributes: BT_BIG_KEYS | BT_VARIABLE_INDEX_KEYS,
    };

    let root_folder = CatalogFolder {
        flags: 0,
        valence: 0,
        folder_id: CNID_ROOT_FOLDER,
        create_date: now,
        content_mod_date: now,
        attribute_mod_date: now,
        access_date: now,
        backup_date: 0,
        permissions: Default::default(),
        text_encoding: 0,
    };
    let mut folder_record = catalog::encode_catalog_key(CNID_ROOT_PARENT, &label_units);
    folder_record.extend_from_slice(&catalog::encode_folder_record(&root_folder));
    let mut thread_record = catalog::encode_catalog_key(CNID_ROOT_FOLDER, &[]);
    thread_record.extend_from_slice(&catalog::encode_thread_record(
        true,
        CNID_ROOT_PARENT,
        &label_units,
    ));

    let catalog_map = ForkMap::from_fork(&vh.catalog_file, bs);
    catalog_map.write_all(dev, 0, &vec![0u8; vh.catalog_file.logical_size as usize])?;
    catalog_map.write_all(dev, 0, &btree::build_header_node(&catalog_header, &[0, 1]))?;
    catalog_map.write_all(
        dev,
        PLUS_NODE_SIZE as u64,
        &btree::build_leaf_node(
            PLUS_NODE_SIZE as usize,
            0,
            0,
            &[folder_record, thread_record],
        ),
    )?;

    // Extents and attributes trees: header-only.
    for (fork, tree_type, max_key, attrs, compare) in [
        (&vh.extents_file, TREE_TYPE_EXTENTS, 10u16, BT_BIG_KEYS, 0u8),
        (
            &vh.attributes_file,
            TREE_TYPE_ATTRIBUTES,
            PLUS_MAX_ATTR_KEY,
            BT_BIG_KEYS | BT_VARIABLE_INDEX_KEYS,
            KEY_COMPARE_BINARY,
        ),
    ] {
        let nodes = (fork.logical_size / PLUS_NODE_SIZE as u64) as u32;
        let header = HeaderRecord {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf_node: 0,
            last_leaf_node: 0,
            node_size: PLUS_NODE_SIZE as u16,
            max_key_length: max_key,
            total_nodes: nodes,
            free_nodes: nodes - 1,
            clump_size: fork.clump_size,
            tree_type,
            key_compare_type: compare,
            attributes: attrs,
        };
        let map = ForkMap::from_fork(fork, bs);
        map.write_all(dev, 0, &vec![0u8; fork.logical_size as usize])?;
        map.write_all(dev, 0, &btree::build_header_node(&header, &[0]))?;
    }

    // Journal structures, when requested.
    if let Some((jib, jstart, jblocks)) = g.journal {
        journal::initialize(
            dev,
            bs,
            jib as u64 * bs as u64,
            jstart as u64 * bs as u64,
            jblocks as u64 * bs as u64,
        )?;
    }

    // Re-write both headers (free_blocks settled above) and sync.
    volume::write_both(dev, &vh)?;

    log::info!(
        "formatted {} volume '{}': {} blocks of {} bytes{}",
        if options.case_sensitive { "HFSX" } else { "HFS+" },
        options.label,
        vh.total_blocks,
        vh.block_size,
        if options.journaled { ", journaled" } else { "" }
    );
    Ok(vh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{probe, FsKind};
    use std::io::Cursor;

    fn blank(size: usize) -> BlockDevice<Cursor<Vec<u8>>> {
        BlockDevice::new(Cursor::new(vec![0u8; size])).unwrap()
    }

    #[test]
    fn test_label_validation() {
        assert!(validate_label("A", false).is_ok());
        assert!(validate_label(&"A".repeat(27), false).is_ok());
        assert!(validate_label(&"A".repeat(28), false).is_err());
        assert!(validate_label("", false).is_err());
        assert!(validate_label("a:b", false).is_err());
        assert!(validate_label(&"A".repeat(255), true).is_ok());
        assert!(validate_label(&"A".repeat(256), true).is_err());
    }

    #[test]
    fn test_hfs_format_basics() {
        let mut dev = blank(4 * 1024 * 1024);
        let mdb = format_hfs(&mut dev, "Test").unwrap();

        // Signature bytes at 1024, Pascal name body at MDB offset 37.
        let mut sig = [0u8; 2];
        dev.read_at(1024, &mut sig).unwrap();
        assert_eq!(sig, [0x42, 0x44]);
        let mut name = [0u8; 5];
        dev.read_at(1024 + 36, &mut name).unwrap();
        assert_eq!(name[0], 4);
        assert_eq!(&name[1..], b"Test");

        // Boot sentinel.
        let mut lk = [0u8; 2];
        dev.read_at(0, &mut lk).unwrap();
        assert_eq!(lk, BOOT_SIGNATURE);

        // Geometry: 4 MiB at 512-byte blocks, minus reserved sectors.
        assert_eq!(mdb.alloc_block_size, 512);
        let usable = 4 * 1024 * 1024 - mdb.alloc_start as u64 * 512 - 1024;
        assert_eq!(mdb.total_blocks as u64, usable / 512);

        // Alternate MDB is identical to the primary.
        let mut primary = vec![0u8; 512];
        let mut alternate = vec![0u8; 512];
        dev.read_at(1024, &mut primary).unwrap();
        dev.read_at(dev.size() - 1024, &mut alternate).unwrap();
        assert_eq!(primary, alternate);

        assert_eq!(probe(&mut dev).unwrap(), Some(FsKind::Hfs));
    }

    #[test]
    fn test_hfs_max_block_count_cap() {
        // 40 MiB at 512-byte blocks would exceed 65535, so the block size
        // scales and the count stays under the 16-bit cap.
        let mut dev = blank(40 * 1024 * 1024);
        let mdb = format_hfs(&mut dev, "Big").unwrap();
        assert!(mdb.total_blocks <= 65_535);
        assert!(mdb.alloc_block_size >= 512);
        assert!(mdb.alloc_block_size.is_power_of_two());
    }

    #[test]
    fn test_hfsplus_format_basics() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();

        let mut sig = [0u8; 2];
        dev.read_at(1024, &mut sig).unwrap();
        assert_eq!(sig, [0x48, 0x2B]);
        assert_eq!(vh.block_size, 512);
        assert_eq!(vh.total_blocks, 16 * 1024 * 2);
        assert_eq!(vh.file_count, 0);
        assert_eq!(vh.folder_count, 0);
        assert!(!vh.is_journaled());

        // free + used must cover the volume.
        let map = ForkMap::from_fork(&vh.allocation_file, vh.block_size);
        let mut bytes = vec![0u8; vh.allocation_file.logical_size as usize];
        map.read_exact(&mut dev, 0, &mut bytes).unwrap();
        let bitmap = Bitmap::from_bytes(bytes, vh.total_blocks);
        assert_eq!(bitmap.count_free(), vh.free_blocks);
        assert_eq!(bitmap.count_used() + vh.free_blocks, vh.total_blocks);
    }

    #[test]
    fn test_hfsplus_journaled_format() {
        let mut dev = blank(32 * 1024 * 1024);
        let options = PlusFormatOptions { journaled: true, ..Default::default() };
        let vh = format_hfsplus(&mut dev, &options).unwrap();

        assert!(vh.is_journaled());
        assert!(vh.journal_info_block != 0);

        let journal = journal::validate(&mut dev, &vh).unwrap();
        assert!(journal.is_clean());
    }

    #[test]
    fn test_hfsx_key_compare_type() {
        let mut dev = blank(16 * 1024 * 1024);
        let options = PlusFormatOptions { case_sensitive: true, ..Default::default() };
        let vh = format_hfsplus(&mut dev, &options).unwrap();
        assert_eq!(vh.signature, HFSX_SIGNATURE);

        let tree =
            crate::btree::BTree::open(&mut dev, ForkMap::from_fork(&vh.catalog_file, vh.block_size))
                .unwrap();
        assert_eq!(tree.header.key_compare_type, KEY_COMPARE_BINARY);
    }

    #[test]
    fn test_volume_name_lives_in_the_catalog() {
        let mut dev = blank(16 * 1024 * 1024);
        let options = PlusFormatOptions { label: "Rescue Disk".into(), ..Default::default() };
        let vh = format_hfsplus(&mut dev, &options).unwrap();

        let tree =
            crate::btree::BTree::open(&mut dev, ForkMap::from_fork(&vh.catalog_file, vh.block_size))
                .unwrap();
        let name = catalog::volume_name(&mut dev, &tree, false).unwrap();
        assert_eq!(name.as_deref(), Some("Rescue Disk"));
    }

    #[test]
    fn test_too_small_device_refused() {
        let mut dev = blank(64 * 1024);
        assert!(matches!(
            format_hfs(&mut dev, "Tiny"),
            Err(HfsError::DeviceTooSmall(_))
        ));
        assert!(matches!(
            format_hfsplus(&mut dev, &PlusFormatOptions::default()),
            Err(HfsError::DeviceTooSmall(_))
        ));
    }
}
