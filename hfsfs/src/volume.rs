//! HFS+ Volume Header codec.
//!
//! The 512-byte Volume Header sits at byte offset 1024, with a bit-identical
//! alternate copy 1024 bytes before the end of the device. It embeds five
//! fork-data descriptors for the system files. Reference: Apple TN1150.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, Write};

use crate::device::BlockDevice;
use crate::error::{HfsError, Result};

/// HFS+ volume header offset from the start of the device.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

/// HFS+ signature: "H+" (0x482B)
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;

/// HFSX signature: "HX" (0x4858), case-sensitive variant
pub const HFSX_SIGNATURE: u16 = 0x4858;

/// HFS+ volume header version
pub const HFS_PLUS_VERSION: u16 = 4;

/// Encoded size of the volume header.
pub const VOLUME_HEADER_SIZE: usize = 512;

// Volume attribute bits, interpreted during check.
pub const ATTR_UNMOUNTED: u32 = 1 << 8;
pub const ATTR_SPARED_BLOCKS: u32 = 1 << 9;
pub const ATTR_NO_CACHE: u32 = 1 << 10;
pub const ATTR_INCONSISTENT: u32 = 1 << 11;
pub const ATTR_JOURNALED: u32 = 1 << 13;
pub const ATTR_SOFTWARE_LOCK: u32 = 1 << 15;

/// An extent descriptor: contiguous range of allocation blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

/// Fork data: describes one byte stream of a file by size and initial extents.
/// An entry with `block_count == 0` terminates the list; continuations live
/// in the extents-overflow B-tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    /// Blocks covered by the inline extent record.
    pub fn inline_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.block_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.logical_size == 0 && self.total_blocks == 0
    }
}

pub(crate) fn read_extent_descriptor<R: Read>(reader: &mut R) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: reader.read_u32::<BigEndian>()?,
        block_count: reader.read_u32::<BigEndian>()?,
    })
}

pub(crate) fn read_fork_data<R: Read>(reader: &mut R) -> Result<ForkData> {
    let logical_size = reader.read_u64::<BigEndian>()?;
    let clump_size = reader.read_u32::<BigEndian>()?;
    let total_blocks = reader.read_u32::<BigEndian>()?;
    let mut extents = [ExtentDescriptor::default(); 8];
    for extent in &mut extents {
        *extent = read_extent_descriptor(reader)?;
    }
    Ok(ForkData {
        logical_size,
        clump_size,
        total_blocks,
        extents,
    })
}

pub(crate) fn write_fork_data<W: Write>(writer: &mut W, fork: &ForkData) -> Result<()> {
    writer.write_u64::<BigEndian>(fork.logical_size)?;
    writer.write_u32::<BigEndian>(fork.clump_size)?;
    writer.write_u32::<BigEndian>(fork.total_blocks)?;
    for extent in &fork.extents {
        writer.write_u32::<BigEndian>(extent.start_block)?;
        writer.write_u32::<BigEndian>(extent.block_count)?;
    }
    Ok(())
}

/// The HFS+ Volume Header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    /// true for the case-sensitive HFSX variant
    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    pub fn has_attribute(&self, bit: u32) -> bool {
        self.attributes & bit != 0
    }

    pub fn is_journaled(&self) -> bool {
        self.has_attribute(ATTR_JOURNALED)
    }

    /// Decode a volume header from a 512-byte buffer.
    ///
    /// A wrong signature, a block size below 512 or not a power of two, or a
    /// zero block count are critical and reject the structure. The version
    /// field is preserved as read; a value other than 4 is a repairable
    /// condition handled by the checker, not a decode failure.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VOLUME_HEADER_SIZE {
            return Err(HfsError::InvalidHeader("volume header buffer too short".into()));
        }
        let mut cursor = Cursor::new(buf);

        let signature = cursor.read_u16::<BigEndian>()?;
        if signature != HFS_PLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(HfsError::BadSignature(signature));
        }

        let version = cursor.read_u16::<BigEndian>()?;
        let attributes = cursor.read_u32::<BigEndian>()?;
        let last_mounted_version = cursor.read_u32::<BigEndian>()?;
        let journal_info_block = cursor.read_u32::<BigEndian>()?;
        let create_date = cursor.read_u32::<BigEndian>()?;
        let modify_date = cursor.read_u32::<BigEndian>()?;
        let backup_date = cursor.read_u32::<BigEndian>()?;
        let checked_date = cursor.read_u32::<BigEndian>()?;
        let file_count = cursor.read_u32::<BigEndian>()?;
        let folder_count = cursor.read_u32::<BigEndian>()?;
        let block_size = cursor.read_u32::<BigEndian>()?;
        let total_blocks = cursor.read_u32::<BigEndian>()?;
        let free_blocks = cursor.read_u32::<BigEndian>()?;
        let next_allocation = cursor.read_u32::<BigEndian>()?;
        let rsrc_clump_size = cursor.read_u32::<BigEndian>()?;
        let data_clump_size = cursor.read_u32::<BigEndian>()?;
        let next_catalog_id = cursor.read_u32::<BigEndian>()?;
        let write_count = cursor.read_u32::<BigEndian>()?;
        let encodings_bitmap = cursor.read_u64::<BigEndian>()?;

        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(HfsError::InvalidHeader(format!(
                "block size {} is not a power of two >= 512",
                block_size
            )));
        }
        if total_blocks == 0 {
            return Err(HfsError::InvalidHeader("zero total blocks".into()));
        }

        let mut finder_info = [0u32; 8];
        for fi in &mut finder_info {
            *fi = cursor.read_u32::<BigEndian>()?;
        }

        let allocation_file = read_fork_data(&mut cursor)?;
        let extents_file = read_fork_data(&mut cursor)?;
        let catalog_file = read_fork_data(&mut cursor)?;
        let attributes_file = read_fork_data(&mut cursor)?;
        let startup_file = read_fork_data(&mut cursor)?;

        Ok(VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encodings_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
        })
    }

    /// Encode the volume header into a fresh 512-byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(VOLUME_HEADER_SIZE);
        buf.write_u16::<BigEndian>(self.signature)?;
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u32::<BigEndian>(self.attributes)?;
        buf.write_u32::<BigEndian>(self.last_mounted_version)?;
        buf.write_u32::<BigEndian>(self.journal_info_block)?;
        buf.write_u32::<BigEndian>(self.create_date)?;
        buf.write_u32::<BigEndian>(self.modify_date)?;
        buf.write_u32::<BigEndian>(self.backup_date)?;
        buf.write_u32::<BigEndian>(self.checked_date)?;
        buf.write_u32::<BigEndian>(self.file_count)?;
        buf.write_u32::<BigEndian>(self.folder_count)?;
        buf.write_u32::<BigEndian>(self.block_size)?;
        buf.write_u32::<BigEndian>(self.total_blocks)?;
        buf.write_u32::<BigEndian>(self.free_blocks)?;
        buf.write_u32::<BigEndian>(self.next_allocation)?;
        buf.write_u32::<BigEndian>(self.rsrc_clump_size)?;
        buf.write_u32::<BigEndian>(self.data_clump_size)?;
        buf.write_u32::<BigEndian>(self.next_catalog_id)?;
        buf.write_u32::<BigEndian>(self.write_count)?;
        buf.write_u64::<BigEndian>(self.encodings_bitmap)?;
        for fi in &self.finder_info {
            buf.write_u32::<BigEndian>(*fi)?;
        }
        write_fork_data(&mut buf, &self.allocation_file)?;
        write_fork_data(&mut buf, &self.extents_file)?;
        write_fork_data(&mut buf, &self.catalog_file)?;
        write_fork_data(&mut buf, &self.attributes_file)?;
        write_fork_data(&mut buf, &self.startup_file)?;
        debug_assert_eq!(buf.len(), VOLUME_HEADER_SIZE);
        Ok(buf)
    }
}

/// Byte offset of the alternate header for a device of `size` bytes.
pub fn alternate_offset(size: u64) -> u64 {
    size - 1024
}

/// Read and decode the primary volume header.
pub fn read_primary<D: Read + Write + Seek>(dev: &mut BlockDevice<D>) -> Result<VolumeHeader> {
    let mut buf = vec![0u8; VOLUME_HEADER_SIZE];
    dev.read_at(VOLUME_HEADER_OFFSET, &mut buf)?;
    VolumeHeader::decode(&buf)
}

/// Read and decode the alternate volume header at `device_size - 1024`.
pub fn read_alternate<D: Read + Write + Seek>(dev: &mut BlockDevice<D>) -> Result<VolumeHeader> {
    let mut buf = vec![0u8; VOLUME_HEADER_SIZE];
    dev.read_at(alternate_offset(dev.size()), &mut buf)?;
    VolumeHeader::decode(&buf)
}

/// Write both header copies in the mandated order:
/// primary, sync, alternate, sync.
pub fn write_both<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    vh: &VolumeHeader,
) -> Result<()> {
    let buf = vh.encode()?;
    dev.write_at(VOLUME_HEADER_OFFSET, &buf)?;
    dev.sync()?;
    dev.write_at(alternate_offset(dev.size()), &buf)?;
    dev.sync()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> VolumeHeader {
        let mut vh = VolumeHeader {
            signature: HFS_PLUS_SIGNATURE,
            version: HFS_PLUS_VERSION,
            attributes: ATTR_UNMOUNTED,
            last_mounted_version: 0x3130_2E30, // '10.0'
            journal_info_block: 0,
            create_date: 0xB000_0000,
            modify_date: 0xB000_0001,
            backup_date: 0,
            checked_date: 0xB000_0002,
            file_count: 12,
            folder_count: 3,
            block_size: 4096,
            total_blocks: 25_600,
            free_blocks: 20_000,
            next_allocation: 600,
            rsrc_clump_size: 65_536,
            data_clump_size: 65_536,
            next_catalog_id: 16,
            write_count: 7,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_file: ForkData::default(),
            extents_file: ForkData::default(),
            catalog_file: ForkData::default(),
            attributes_file: ForkData::default(),
            startup_file: ForkData::default(),
        };
        vh.allocation_file = ForkData {
            logical_size: 4096,
            clump_size: 4096,
            total_blocks: 1,
            extents: {
                let mut e = [ExtentDescriptor::default(); 8];
                e[0] = ExtentDescriptor { start_block: 1, block_count: 1 };
                e
            },
        };
        vh.catalog_file = ForkData {
            logical_size: 16_384,
            clump_size: 16_384,
            total_blocks: 4,
            extents: {
                let mut e = [ExtentDescriptor::default(); 8];
                e[0] = ExtentDescriptor { start_block: 2, block_count: 4 };
                e
            },
        };
        vh
    }

    #[test]
    fn test_roundtrip_every_field() {
        let vh = sample();
        let buf = vh.encode().unwrap();
        assert_eq!(buf.len(), VOLUME_HEADER_SIZE);
        let back = VolumeHeader::decode(&buf).unwrap();
        assert_eq!(vh, back);
    }

    #[test]
    fn test_hfsx_signature() {
        let mut vh = sample();
        vh.signature = HFSX_SIGNATURE;
        let back = VolumeHeader::decode(&vh.encode().unwrap()).unwrap();
        assert!(back.is_hfsx());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut buf = sample().encode().unwrap();
        buf[0] = 0x42;
        buf[1] = 0x44;
        assert!(matches!(
            VolumeHeader::decode(&buf),
            Err(HfsError::BadSignature(0x4244))
        ));
    }

    #[test]
    fn test_small_block_size_is_critical() {
        let mut vh = sample();
        vh.block_size = 256;
        let buf = vh.encode().unwrap();
        assert!(matches!(VolumeHeader::decode(&buf), Err(HfsError::InvalidHeader(_))));
    }

    #[test]
    fn test_nonstandard_version_is_not_a_decode_failure() {
        let mut vh = sample();
        vh.version = 5;
        let back = VolumeHeader::decode(&vh.encode().unwrap()).unwrap();
        assert_eq!(back.version, 5);
    }

    #[test]
    fn test_write_both_copies_are_identical() {
        use std::io::Cursor;
        let mut dev =
            BlockDevice::new(Cursor::new(vec![0u8; 1024 * 1024])).unwrap();
        let vh = sample();
        write_both(&mut dev, &vh).unwrap();

        let primary = read_primary(&mut dev).unwrap();
        let alternate = read_alternate(&mut dev).unwrap();
        assert_eq!(primary, alternate);
        assert_eq!(primary, vh);
    }
}
