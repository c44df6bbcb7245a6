//! HFS Master Directory Block codec.
//!
//! The MDB lives in sector 2 (byte offset 1024) with an identical alternate
//! copy 1024 bytes before the end of the device. The layout is fixed and
//! carries no checksum; all fields are big-endian. Reference: Inside
//! Macintosh: Files (1992).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{HfsError, Result};

/// HFS signature: "BD" (0x4244)
pub const HFS_SIGNATURE: u16 = 0x4244;

/// Size of the decoded MDB structure including the system-file extent trailer.
pub const MDB_SIZE: usize = 162;

/// Maximum HFS volume name length (Pascal string body).
pub const HFS_MAX_NAME_LEN: usize = 27;

/// Maximum allocation-block count; HFS stores the count in 16 bits.
pub const HFS_MAX_BLOCKS: u32 = 65_535;

/// An HFS extent: a contiguous run of allocation blocks (16-bit fields).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HfsExtent {
    pub start_block: u16,
    pub block_count: u16,
}

/// HFS extent record: three extents; a zero `block_count` terminates the list.
pub type HfsExtentRecord = [HfsExtent; 3];

pub(crate) fn decode_hfs_extents(buf: &[u8]) -> HfsExtentRecord {
    let mut rec = [HfsExtent::default(); 3];
    for (i, e) in rec.iter_mut().enumerate() {
        e.start_block = BigEndian::read_u16(&buf[i * 4..]);
        e.block_count = BigEndian::read_u16(&buf[i * 4 + 2..]);
    }
    rec
}

pub(crate) fn encode_hfs_extents(rec: &HfsExtentRecord, buf: &mut [u8]) {
    for (i, e) in rec.iter().enumerate() {
        BigEndian::write_u16(&mut buf[i * 4..], e.start_block);
        BigEndian::write_u16(&mut buf[i * 4 + 2..], e.block_count);
    }
}

/// The Master Directory Block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdb {
    pub signature: u16,
    pub create_date: u32,
    pub modify_date: u32,
    pub attributes: u16,
    /// Files in the root directory.
    pub root_file_count: u16,
    /// First sector of the volume bitmap; always 3.
    pub bitmap_start: u16,
    /// Allocation search hint. Written but never consulted.
    pub alloc_ptr: u16,
    pub total_blocks: u16,
    pub alloc_block_size: u32,
    pub clump_size: u32,
    /// First sector of the allocation-block area.
    pub alloc_start: u16,
    pub next_cnid: u32,
    pub free_blocks: u16,
    /// Volume name, at most 27 MacRoman characters.
    pub volume_name: String,
    pub backup_date: u32,
    pub backup_seq: u16,
    pub write_count: u32,
    pub extents_clump_size: u32,
    pub catalog_clump_size: u32,
    /// Directories in the root directory.
    pub root_dir_count: u16,
    pub file_count: u32,
    /// Directory count; on HFS the root directory is included.
    pub folder_count: u32,
    pub finder_info: [u32; 8],
    pub embed_signature: u16,
    pub embed_extent: HfsExtent,
    pub extents_file_size: u32,
    pub extents_file_extents: HfsExtentRecord,
    pub catalog_file_size: u32,
    pub catalog_file_extents: HfsExtentRecord,
}

impl Mdb {
    /// Decode an MDB from a buffer of at least `MDB_SIZE` bytes.
    ///
    /// A wrong signature, a zero or non-power-of-two allocation block size,
    /// or a zero block count are critical and refuse the whole structure.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MDB_SIZE {
            return Err(HfsError::InvalidHeader("MDB buffer too short".into()));
        }

        let signature = BigEndian::read_u16(&buf[0..]);
        if signature != HFS_SIGNATURE {
            return Err(HfsError::BadSignature(signature));
        }

        let alloc_block_size = BigEndian::read_u32(&buf[20..]);
        if alloc_block_size == 0 || !alloc_block_size.is_power_of_two() || alloc_block_size < 512 {
            return Err(HfsError::InvalidHeader(format!(
                "allocation block size {} is not a power of two >= 512",
                alloc_block_size
            )));
        }

        let total_blocks = BigEndian::read_u16(&buf[18..]);
        if total_blocks == 0 {
            return Err(HfsError::InvalidHeader("zero allocation blocks".into()));
        }

        let name_len = (buf[36] as usize).min(HFS_MAX_NAME_LEN);
        let volume_name = buf[37..37 + name_len]
            .iter()
            .map(|&b| b as char)
            .collect::<String>();

        let mut finder_info = [0u32; 8];
        for (i, fi) in finder_info.iter_mut().enumerate() {
            *fi = BigEndian::read_u32(&buf[92 + i * 4..]);
        }

        Ok(Mdb {
            signature,
            create_date: BigEndian::read_u32(&buf[2..]),
            modify_date: BigEndian::read_u32(&buf[6..]),
            attributes: BigEndian::read_u16(&buf[10..]),
            root_file_count: BigEndian::read_u16(&buf[12..]),
            bitmap_start: BigEndian::read_u16(&buf[14..]),
            alloc_ptr: BigEndian::read_u16(&buf[16..]),
            total_blocks,
            alloc_block_size,
            clump_size: BigEndian::read_u32(&buf[24..]),
            alloc_start: BigEndian::read_u16(&buf[28..]),
            next_cnid: BigEndian::read_u32(&buf[30..]),
            free_blocks: BigEndian::read_u16(&buf[34..]),
            volume_name,
            backup_date: BigEndian::read_u32(&buf[64..]),
            backup_seq: BigEndian::read_u16(&buf[68..]),
            write_count: BigEndian::read_u32(&buf[70..]),
            extents_clump_size: BigEndian::read_u32(&buf[74..]),
            catalog_clump_size: BigEndian::read_u32(&buf[78..]),
            root_dir_count: BigEndian::read_u16(&buf[82..]),
            file_count: BigEndian::read_u32(&buf[84..]),
            folder_count: BigEndian::read_u32(&buf[88..]),
            finder_info,
            embed_signature: BigEndian::read_u16(&buf[124..]),
            embed_extent: HfsExtent {
                start_block: BigEndian::read_u16(&buf[126..]),
                block_count: BigEndian::read_u16(&buf[128..]),
            },
            extents_file_size: BigEndian::read_u32(&buf[130..]),
            extents_file_extents: decode_hfs_extents(&buf[134..146]),
            catalog_file_size: BigEndian::read_u32(&buf[146..]),
            catalog_file_extents: decode_hfs_extents(&buf[150..162]),
        })
    }

    /// Encode the MDB into a buffer of at least `MDB_SIZE` bytes,
    /// zero-filling everything it owns first.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..MDB_SIZE].fill(0);

        BigEndian::write_u16(&mut buf[0..], self.signature);
        BigEndian::write_u32(&mut buf[2..], self.create_date);
        BigEndian::write_u32(&mut buf[6..], self.modify_date);
        BigEndian::write_u16(&mut buf[10..], self.attributes);
        BigEndian::write_u16(&mut buf[12..], self.root_file_count);
        BigEndian::write_u16(&mut buf[14..], self.bitmap_start);
        BigEndian::write_u16(&mut buf[16..], self.alloc_ptr);
        BigEndian::write_u16(&mut buf[18..], self.total_blocks);
        BigEndian::write_u32(&mut buf[20..], self.alloc_block_size);
        BigEndian::write_u32(&mut buf[24..], self.clump_size);
        BigEndian::write_u16(&mut buf[28..], self.alloc_start);
        BigEndian::write_u32(&mut buf[30..], self.next_cnid);
        BigEndian::write_u16(&mut buf[34..], self.free_blocks);

        let name: Vec<u8> = self.volume_name.bytes().take(HFS_MAX_NAME_LEN).collect();
        buf[36] = name.len() as u8;
        buf[37..37 + name.len()].copy_from_slice(&name);

        BigEndian::write_u32(&mut buf[64..], self.backup_date);
        BigEndian::write_u16(&mut buf[68..], self.backup_seq);
        BigEndian::write_u32(&mut buf[70..], self.write_count);
        BigEndian::write_u32(&mut buf[74..], self.extents_clump_size);
        BigEndian::write_u32(&mut buf[78..], self.catalog_clump_size);
        BigEndian::write_u16(&mut buf[82..], self.root_dir_count);
        BigEndian::write_u32(&mut buf[84..], self.file_count);
        BigEndian::write_u32(&mut buf[88..], self.folder_count);
        for (i, fi) in self.finder_info.iter().enumerate() {
            BigEndian::write_u32(&mut buf[92 + i * 4..], *fi);
        }
        BigEndian::write_u16(&mut buf[124..], self.embed_signature);
        BigEndian::write_u16(&mut buf[126..], self.embed_extent.start_block);
        BigEndian::write_u16(&mut buf[128..], self.embed_extent.block_count);
        BigEndian::write_u32(&mut buf[130..], self.extents_file_size);
        encode_hfs_extents(&self.extents_file_extents, &mut buf[134..146]);
        BigEndian::write_u32(&mut buf[146..], self.catalog_file_size);
        encode_hfs_extents(&self.catalog_file_extents, &mut buf[150..162]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Mdb {
        Mdb {
            signature: HFS_SIGNATURE,
            create_date: 0xA0B0_C0D0,
            modify_date: 0xA0B0_C0D1,
            attributes: 0x0100,
            root_file_count: 0,
            bitmap_start: 3,
            alloc_ptr: 5,
            total_blocks: 8000,
            alloc_block_size: 512,
            clump_size: 2048,
            alloc_start: 5,
            next_cnid: 16,
            free_blocks: 7995,
            volume_name: "Macintosh HD".into(),
            backup_date: 0,
            backup_seq: 0,
            write_count: 1,
            extents_clump_size: 2048,
            catalog_clump_size: 2048,
            root_dir_count: 0,
            file_count: 0,
            folder_count: 1,
            finder_info: [0; 8],
            embed_signature: 0,
            embed_extent: HfsExtent::default(),
            extents_file_size: 512,
            extents_file_extents: [
                HfsExtent { start_block: 0, block_count: 1 },
                HfsExtent::default(),
                HfsExtent::default(),
            ],
            catalog_file_size: 2048,
            catalog_file_extents: [
                HfsExtent { start_block: 1, block_count: 4 },
                HfsExtent::default(),
                HfsExtent::default(),
            ],
        }
    }

    #[test]
    fn test_roundtrip_every_field() {
        let mdb = sample();
        let mut buf = [0u8; 512];
        mdb.encode(&mut buf);
        let back = Mdb::decode(&buf).unwrap();
        assert_eq!(mdb, back);
    }

    #[test]
    fn test_pascal_name_offsets() {
        let mdb = sample();
        let mut buf = [0u8; 512];
        mdb.encode(&mut buf);
        // Length byte at offset 36, body at 37.
        assert_eq!(buf[36] as usize, "Macintosh HD".len());
        assert_eq!(&buf[37..41], b"Maci");
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        buf[0] = 0x48;
        buf[1] = 0x2B;
        assert!(matches!(Mdb::decode(&buf), Err(HfsError::BadSignature(0x482B))));
    }

    #[test]
    fn test_nonpow2_block_size_is_critical() {
        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        BigEndian::write_u32(&mut buf[20..], 768);
        assert!(matches!(Mdb::decode(&buf), Err(HfsError::InvalidHeader(_))));
    }

    #[test]
    fn test_zero_blocks_is_critical() {
        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        BigEndian::write_u16(&mut buf[18..], 0);
        assert!(matches!(Mdb::decode(&buf), Err(HfsError::InvalidHeader(_))));
    }

    #[test]
    fn test_name_length_clamped_on_decode() {
        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        buf[36] = 200; // corrupt length byte
        let mdb = Mdb::decode(&buf).unwrap();
        assert_eq!(mdb.volume_name.len(), HFS_MAX_NAME_LEN);
    }
}
