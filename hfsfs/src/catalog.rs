//! Catalog key and record codecs for HFS+ and classic HFS.
//!
//! The catalog B-tree maps `(parent CNID, name)` to folder, file and thread
//! records. HFS+ names are length-prefixed UTF-16; HFS names are Pascal
//! strings in MacRoman. Thread records invert the mapping: keyed by a CNID
//! with an empty name, their payload names the `(parent, name)` that owns
//! the CNID.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Seek, Write};

use crate::btree::BTree;
use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::mdb::{decode_hfs_extents, encode_hfs_extents, HfsExtentRecord};
use crate::unicode;
use crate::volume::{read_fork_data, write_fork_data, ForkData};

// Well-known Catalog Node IDs.
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_EXTENTS_FILE: u32 = 3;
pub const CNID_CATALOG_FILE: u32 = 4;
pub const CNID_BAD_BLOCKS_FILE: u32 = 5;
pub const CNID_ALLOCATION_FILE: u32 = 6;
pub const CNID_STARTUP_FILE: u32 = 7;
pub const CNID_ATTRIBUTES_FILE: u32 = 8;
/// First CNID available to user files; 9-15 are reserved.
pub const CNID_FIRST_USER: u32 = 16;

// HFS+ catalog record types.
pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

// HFS catalog record types (single byte).
pub const HFS_REC_DIR: u8 = 1;
pub const HFS_REC_FILE: u8 = 2;
pub const HFS_REC_DIR_THREAD: u8 = 3;
pub const HFS_REC_FILE_THREAD: u8 = 4;

/// Maximum HFS+ name length in UTF-16 code units.
pub const MAX_PLUS_NAME_LEN: usize = 255;

/// Maximum HFS file/folder name length in bytes.
pub const MAX_HFS_NAME_LEN: usize = 31;

// ── HFS+ keys ────────────────────────────────────────────────────────────

/// HFS+ catalog key: (parent CNID, UTF-16 name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub node_name: Vec<u16>,
}

/// Parse an HFS+ catalog key from raw record bytes.
/// Returns the key and the byte offset of the record payload.
pub fn parse_catalog_key(data: &[u8]) -> Result<(CatalogKey, usize)> {
    if data.len() < 8 {
        return Err(HfsError::InvalidBTree("catalog key too short".into()));
    }
    let key_length = BigEndian::read_u16(&data[0..]) as usize;
    let parent_id = BigEndian::read_u32(&data[2..]);
    let name_length = BigEndian::read_u16(&data[6..]) as usize;

    let name_end = 8 + name_length * 2;
    if name_length > MAX_PLUS_NAME_LEN || name_end > data.len() || 6 + name_length * 2 != key_length
    {
        return Err(HfsError::InvalidBTree(format!(
            "catalog key inconsistent: key_length={}, name_length={}, record_len={}",
            key_length,
            name_length,
            data.len()
        )));
    }

    let node_name = unicode::utf16be_to_units(&data[8..name_end]);
    Ok((CatalogKey { parent_id, node_name }, 2 + key_length))
}

/// Encode an HFS+ catalog key (length prefix included).
pub fn encode_catalog_key(parent_id: u32, name: &[u16]) -> Vec<u8> {
    let key_length = 6 + name.len() * 2;
    let mut out = Vec::with_capacity(2 + key_length);
    out.write_u16::<BigEndian>(key_length as u16).unwrap();
    out.write_u32::<BigEndian>(parent_id).unwrap();
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    out.extend_from_slice(&unicode::units_to_utf16be(name));
    out
}

impl CatalogKey {
    pub fn compare(&self, other: &CatalogKey, case_sensitive: bool) -> Ordering {
        match self.parent_id.cmp(&other.parent_id) {
            Ordering::Equal => {}
            ord => return ord,
        }
        if case_sensitive {
            unicode::compare_binary(&self.node_name, &other.node_name)
        } else {
            unicode::compare_folded(&self.node_name, &other.node_name)
        }
    }
}

// ── HFS+ records ─────────────────────────────────────────────────────────

/// BSD-style permissions carried by HFS+ catalog records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFolder {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: BsdInfo,
    pub text_encoding: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFile {
    pub flags: u16,
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: BsdInfo,
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

/// Thread payload: the `(parent, name)` that names this CNID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogThread {
    pub parent_id: u32,
    pub node_name: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(CatalogFolder),
    File(CatalogFile),
    FolderThread(CatalogThread),
    FileThread(CatalogThread),
}

impl CatalogRecord {
    pub fn is_thread(&self) -> bool {
        matches!(self, CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_))
    }
}

fn parse_bsd_info(cursor: &mut Cursor<&[u8]>) -> Result<BsdInfo> {
    Ok(BsdInfo {
        owner_id: cursor.read_u32::<BigEndian>()?,
        group_id: cursor.read_u32::<BigEndian>()?,
        admin_flags: cursor.read_u8()?,
        owner_flags: cursor.read_u8()?,
        file_mode: cursor.read_u16::<BigEndian>()?,
        special: cursor.read_u32::<BigEndian>()?,
    })
}

fn write_bsd_info<W: Write>(writer: &mut W, info: &BsdInfo) -> Result<()> {
    writer.write_u32::<BigEndian>(info.owner_id)?;
    writer.write_u32::<BigEndian>(info.group_id)?;
    writer.write_u8(info.admin_flags)?;
    writer.write_u8(info.owner_flags)?;
    writer.write_u16::<BigEndian>(info.file_mode)?;
    writer.write_u32::<BigEndian>(info.special)?;
    Ok(())
}

/// Parse an HFS+ catalog record payload (the bytes after the key).
pub fn parse_catalog_record(data: &[u8]) -> Result<CatalogRecord> {
    if data.len() < 2 {
        return Err(HfsError::InvalidBTree("catalog record too short".into()));
    }
    let record_type = BigEndian::read_u16(data);
    let mut cursor = Cursor::new(data);
    cursor.set_position(2);

    match record_type {
        RECORD_TYPE_FOLDER => {
            let flags = cursor.read_u16::<BigEndian>()?;
            let valence = cursor.read_u32::<BigEndian>()?;
            let folder_id = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let permissions = parse_bsd_info(&mut cursor)?;
            let mut skip = [0u8; 32]; // user info + Finder info
            cursor.read_exact(&mut skip)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;

            Ok(CatalogRecord::Folder(CatalogFolder {
                flags,
                valence,
                folder_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                text_encoding,
            }))
        }
        RECORD_TYPE_FILE => {
            let flags = cursor.read_u16::<BigEndian>()?;
            let _reserved = cursor.read_u32::<BigEndian>()?;
            let file_id = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let permissions = parse_bsd_info(&mut cursor)?;
            let mut skip = [0u8; 32];
            cursor.read_exact(&mut skip)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;
            let _reserved2 = cursor.read_u32::<BigEndian>()?;
            let data_fork = read_fork_data(&mut cursor)?;
            let resource_fork = read_fork_data(&mut cursor)?;

            Ok(CatalogRecord::File(CatalogFile {
                flags,
                file_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                text_encoding,
                data_fork,
                resource_fork,
            }))
        }
        RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
            let _reserved = cursor.read_u16::<BigEndian>()?;
            let parent_id = cursor.read_u32::<BigEndian>()?;
            let name_length = cursor.read_u16::<BigEndian>()? as usize;
            if name_length > MAX_PLUS_NAME_LEN {
                return Err(HfsError::InvalidBTree(format!(
                    "thread name length {}",
                    name_length
                )));
            }
            let mut name_buf = vec![0u8; name_length * 2];
            cursor.read_exact(&mut name_buf)?;
            let thread = CatalogThread {
                parent_id,
                node_name: unicode::utf16be_to_units(&name_buf),
            };
            if record_type == RECORD_TYPE_FOLDER_THREAD {
                Ok(CatalogRecord::FolderThread(thread))
            } else {
                Ok(CatalogRecord::FileThread(thread))
            }
        }
        other => Err(HfsError::InvalidBTree(format!(
            "unknown catalog record type: 0x{:04X}",
            other
        ))),
    }
}

/// Encode an HFS+ folder record payload (88 bytes).
pub fn encode_folder_record(folder: &CatalogFolder) -> Vec<u8> {
    let mut out = Vec::with_capacity(88);
    out.write_u16::<BigEndian>(RECORD_TYPE_FOLDER).unwrap();
    out.write_u16::<BigEndian>(folder.flags).unwrap();
    out.write_u32::<BigEndian>(folder.valence).unwrap();
    out.write_u32::<BigEndian>(folder.folder_id).unwrap();
    out.write_u32::<BigEndian>(folder.create_date).unwrap();
    out.write_u32::<BigEndian>(folder.content_mod_date).unwrap();
    out.write_u32::<BigEndian>(folder.attribute_mod_date).unwrap();
    out.write_u32::<BigEndian>(folder.access_date).unwrap();
    out.write_u32::<BigEndian>(folder.backup_date).unwrap();
    write_bsd_info(&mut out, &folder.permissions).unwrap();
    out.extend_from_slice(&[0u8; 32]); // user info + Finder info
    out.write_u32::<BigEndian>(folder.text_encoding).unwrap();
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    out
}

/// Encode an HFS+ file record payload (248 bytes).
pub fn encode_file_record(file: &CatalogFile) -> Vec<u8> {
    let mut out = Vec::with_capacity(248);
    out.write_u16::<BigEndian>(RECORD_TYPE_FILE).unwrap();
    out.write_u16::<BigEndian>(file.flags).unwrap();
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    out.write_u32::<BigEndian>(file.file_id).unwrap();
    out.write_u32::<BigEndian>(file.create_date).unwrap();
    out.write_u32::<BigEndian>(file.content_mod_date).unwrap();
    out.write_u32::<BigEndian>(file.attribute_mod_date).unwrap();
    out.write_u32::<BigEndian>(file.access_date).unwrap();
    out.write_u32::<BigEndian>(file.backup_date).unwrap();
    write_bsd_info(&mut out, &file.permissions).unwrap();
    out.extend_from_slice(&[0u8; 32]);
    out.write_u32::<BigEndian>(file.text_encoding).unwrap();
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    write_fork_data(&mut out, &file.data_fork).unwrap();
    write_fork_data(&mut out, &file.resource_fork).unwrap();
    out
}

/// Encode an HFS+ thread record payload.
pub fn encode_thread_record(folder: bool, parent_id: u32, name: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + name.len() * 2);
    let record_type = if folder {
        RECORD_TYPE_FOLDER_THREAD
    } else {
        RECORD_TYPE_FILE_THREAD
    };
    out.write_u16::<BigEndian>(record_type).unwrap();
    out.write_u16::<BigEndian>(0).unwrap(); // reserved
    out.write_u32::<BigEndian>(parent_id).unwrap();
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    out.extend_from_slice(&unicode::units_to_utf16be(name));
    out
}

/// Order two raw HFS+ catalog records by key.
pub fn compare_plus_catalog_records(a: &[u8], b: &[u8], case_sensitive: bool) -> Ordering {
    match (parse_catalog_key(a), parse_catalog_key(b)) {
        (Ok((ka, _)), Ok((kb, _))) => ka.compare(&kb, case_sensitive),
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

/// Exact catalog lookup by (parent, name).
pub fn lookup<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    case_sensitive: bool,
    parent_id: u32,
    name: &[u16],
) -> Result<Option<(CatalogKey, CatalogRecord)>> {
    let target = CatalogKey { parent_id, node_name: name.to_vec() };
    let compare = |record: &[u8]| -> Ordering {
        match parse_catalog_key(record) {
            Ok((key, _)) => key.compare(&target, case_sensitive),
            Err(_) => Ordering::Less,
        }
    };

    match tree.search(dev, &compare)? {
        Some((node, i)) => {
            let record = node.record(i)?;
            let (key, payload) = parse_catalog_key(record)?;
            if payload >= record.len() {
                return Err(HfsError::InvalidBTree("record data missing after key".into()));
            }
            let parsed = parse_catalog_record(&record[payload..])?;
            Ok(Some((key, parsed)))
        }
        None => Ok(None),
    }
}

/// Fetch the thread record of a CNID (key `(cnid, "")`).
pub fn lookup_thread<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    case_sensitive: bool,
    cnid: u32,
) -> Result<Option<CatalogThread>> {
    Ok(match lookup(dev, tree, case_sensitive, cnid, &[])? {
        Some((_, CatalogRecord::FolderThread(t))) | Some((_, CatalogRecord::FileThread(t))) => {
            Some(t)
        }
        _ => None,
    })
}

/// The volume name is the root folder's name, recorded in the thread record
/// of CNID 2.
pub fn volume_name<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    case_sensitive: bool,
) -> Result<Option<String>> {
    Ok(lookup_thread(dev, tree, case_sensitive, CNID_ROOT_FOLDER)?
        .map(|t| unicode::units_to_string(&t.node_name)))
}

// ── HFS keys ─────────────────────────────────────────────────────────────

/// HFS catalog key: (parent CNID, MacRoman name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfsCatalogKey {
    pub parent_id: u32,
    pub name: Vec<u8>,
}

impl HfsCatalogKey {
    pub fn compare(&self, other: &HfsCatalogKey) -> Ordering {
        match self.parent_id.cmp(&other.parent_id) {
            Ordering::Equal => unicode::compare_mac_roman(&self.name, &other.name),
            ord => ord,
        }
    }
}

/// Parse an HFS catalog key. Returns the key and the even-aligned payload
/// offset.
pub fn parse_hfs_catalog_key(data: &[u8]) -> Result<(HfsCatalogKey, usize)> {
    if data.len() < 7 {
        return Err(HfsError::InvalidBTree("catalog key too short".into()));
    }
    let key_len = data[0] as usize;
    let parent_id = BigEndian::read_u32(&data[2..]);
    let name_len = data[6] as usize;
    if name_len > MAX_HFS_NAME_LEN || key_len != 6 + name_len || 7 + name_len > data.len() {
        return Err(HfsError::InvalidBTree(format!(
            "catalog key inconsistent: key_len={}, name_len={}",
            key_len, name_len
        )));
    }
    let name = data[7..7 + name_len].to_vec();
    let mut payload = 1 + key_len;
    if payload % 2 != 0 {
        payload += 1;
    }
    Ok((HfsCatalogKey { parent_id, name }, payload))
}

/// Encode an HFS catalog key, padded to an even length.
pub fn encode_hfs_catalog_key(parent_id: u32, name: &[u8]) -> Vec<u8> {
    let key_len = 6 + name.len();
    let mut out = Vec::with_capacity(1 + key_len + 1);
    out.push(key_len as u8);
    out.push(0); // reserved
    out.write_u32::<BigEndian>(parent_id).unwrap();
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    if out.len() % 2 != 0 {
        out.push(0);
    }
    out
}

// ── HFS records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HfsCatalogDir {
    pub flags: u16,
    pub valence: u16,
    pub dir_id: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HfsCatalogFile {
    pub file_id: u32,
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub data_start_block: u16,
    pub data_logical_size: u32,
    pub data_physical_size: u32,
    pub rsrc_start_block: u16,
    pub rsrc_logical_size: u32,
    pub rsrc_physical_size: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub clump_size: u16,
    pub data_extents: HfsExtentRecord,
    pub rsrc_extents: HfsExtentRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfsCatalogThread {
    pub parent_id: u32,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HfsCatalogRecord {
    Dir(HfsCatalogDir),
    File(HfsCatalogFile),
    DirThread(HfsCatalogThread),
    FileThread(HfsCatalogThread),
}

impl HfsCatalogRecord {
    pub fn is_thread(&self) -> bool {
        matches!(
            self,
            HfsCatalogRecord::DirThread(_) | HfsCatalogRecord::FileThread(_)
        )
    }
}

/// Parse an HFS catalog record payload.
pub fn parse_hfs_catalog_record(data: &[u8]) -> Result<HfsCatalogRecord> {
    if data.is_empty() {
        return Err(HfsError::InvalidBTree("catalog record too short".into()));
    }
    match data[0] {
        HFS_REC_DIR => {
            if data.len() < 70 {
                return Err(HfsError::InvalidBTree("directory record too short".into()));
            }
            Ok(HfsCatalogRecord::Dir(HfsCatalogDir {
                flags: BigEndian::read_u16(&data[2..]),
                valence: BigEndian::read_u16(&data[4..]),
                dir_id: BigEndian::read_u32(&data[6..]),
                create_date: BigEndian::read_u32(&data[10..]),
                modify_date: BigEndian::read_u32(&data[14..]),
                backup_date: BigEndian::read_u32(&data[18..]),
            }))
        }
        HFS_REC_FILE => {
            if data.len() < 102 {
                return Err(HfsError::InvalidBTree("file record too short".into()));
            }
            let mut file_type = [0u8; 4];
            let mut creator = [0u8; 4];
            file_type.copy_from_slice(&data[4..8]);
            creator.copy_from_slice(&data[8..12]);
            Ok(HfsCatalogRecord::File(HfsCatalogFile {
                file_id: BigEndian::read_u32(&data[20..]),
                file_type,
                creator,
                data_start_block: BigEndian::read_u16(&data[24..]),
                data_logical_size: BigEndian::read_u32(&data[26..]),
                data_physical_size: BigEndian::read_u32(&data[30..]),
                rsrc_start_block: BigEndian::read_u16(&data[34..]),
                rsrc_logical_size: BigEndian::read_u32(&data[36..]),
                rsrc_physical_size: BigEndian::read_u32(&data[40..]),
                create_date: BigEndian::read_u32(&data[44..]),
                modify_date: BigEndian::read_u32(&data[48..]),
                backup_date: BigEndian::read_u32(&data[52..]),
                clump_size: BigEndian::read_u16(&data[72..]),
                data_extents: decode_hfs_extents(&data[74..86]),
                rsrc_extents: decode_hfs_extents(&data[86..98]),
            }))
        }
        HFS_REC_DIR_THREAD | HFS_REC_FILE_THREAD => {
            if data.len() < 46 {
                return Err(HfsError::InvalidBTree("thread record too short".into()));
            }
            let name_len = (data[14] as usize).min(MAX_HFS_NAME_LEN);
            let thread = HfsCatalogThread {
                parent_id: BigEndian::read_u32(&data[10..]),
                name: data[15..15 + name_len].to_vec(),
            };
            if data[0] == HFS_REC_DIR_THREAD {
                Ok(HfsCatalogRecord::DirThread(thread))
            } else {
                Ok(HfsCatalogRecord::FileThread(thread))
            }
        }
        other => Err(HfsError::InvalidBTree(format!(
            "unknown catalog record type: {}",
            other
        ))),
    }
}

/// Encode an HFS directory record payload (70 bytes).
pub fn encode_hfs_dir_record(dir: &HfsCatalogDir) -> Vec<u8> {
    let mut out = vec![0u8; 70];
    out[0] = HFS_REC_DIR;
    BigEndian::write_u16(&mut out[2..], dir.flags);
    BigEndian::write_u16(&mut out[4..], dir.valence);
    BigEndian::write_u32(&mut out[6..], dir.dir_id);
    BigEndian::write_u32(&mut out[10..], dir.create_date);
    BigEndian::write_u32(&mut out[14..], dir.modify_date);
    BigEndian::write_u32(&mut out[18..], dir.backup_date);
    out
}

/// Encode an HFS file record payload (102 bytes).
pub fn encode_hfs_file_record(file: &HfsCatalogFile) -> Vec<u8> {
    let mut out = vec![0u8; 102];
    out[0] = HFS_REC_FILE;
    out[4..8].copy_from_slice(&file.file_type);
    out[8..12].copy_from_slice(&file.creator);
    BigEndian::write_u32(&mut out[20..], file.file_id);
    BigEndian::write_u16(&mut out[24..], file.data_start_block);
    BigEndian::write_u32(&mut out[26..], file.data_logical_size);
    BigEndian::write_u32(&mut out[30..], file.data_physical_size);
    BigEndian::write_u16(&mut out[34..], file.rsrc_start_block);
    BigEndian::write_u32(&mut out[36..], file.rsrc_logical_size);
    BigEndian::write_u32(&mut out[40..], file.rsrc_physical_size);
    BigEndian::write_u32(&mut out[44..], file.create_date);
    BigEndian::write_u32(&mut out[48..], file.modify_date);
    BigEndian::write_u32(&mut out[52..], file.backup_date);
    BigEndian::write_u16(&mut out[72..], file.clump_size);
    encode_hfs_extents(&file.data_extents, &mut out[74..86]);
    encode_hfs_extents(&file.rsrc_extents, &mut out[86..98]);
    out
}

/// Encode an HFS thread record payload (46 bytes, fixed-width name field).
pub fn encode_hfs_thread_record(dir: bool, parent_id: u32, name: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 46];
    out[0] = if dir { HFS_REC_DIR_THREAD } else { HFS_REC_FILE_THREAD };
    BigEndian::write_u32(&mut out[10..], parent_id);
    let len = name.len().min(MAX_HFS_NAME_LEN);
    out[14] = len as u8;
    out[15..15 + len].copy_from_slice(&name[..len]);
    out
}

/// Order two raw HFS catalog records by key.
pub fn compare_hfs_catalog_records(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_hfs_catalog_key(a), parse_hfs_catalog_key(b)) {
        (Ok((ka, _)), Ok((kb, _))) => ka.compare(&kb),
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_key_roundtrip() {
        let name = unicode::string_to_units("System Folder");
        let encoded = encode_catalog_key(2, &name);
        let (key, payload) = parse_catalog_key(&encoded).unwrap();
        assert_eq!(key.parent_id, 2);
        assert_eq!(key.node_name, name);
        assert_eq!(payload, encoded.len());
    }

    #[test]
    fn test_plus_key_ordering_parent_dominates() {
        let a = CatalogKey { parent_id: 2, node_name: unicode::string_to_units("zzz") };
        let b = CatalogKey { parent_id: 3, node_name: unicode::string_to_units("aaa") };
        assert_eq!(a.compare(&b, false), Ordering::Less);
    }

    #[test]
    fn test_plus_key_case_sensitivity_switch() {
        let a = CatalogKey { parent_id: 2, node_name: unicode::string_to_units("File") };
        let b = CatalogKey { parent_id: 2, node_name: unicode::string_to_units("file") };
        assert_eq!(a.compare(&b, false), Ordering::Equal);
        assert_eq!(a.compare(&b, true), Ordering::Less);
    }

    #[test]
    fn test_folder_record_roundtrip() {
        let folder = CatalogFolder {
            flags: 0,
            valence: 4,
            folder_id: 2,
            create_date: 100,
            content_mod_date: 200,
            attribute_mod_date: 200,
            access_date: 300,
            backup_date: 0,
            permissions: BsdInfo { owner_id: 501, group_id: 20, file_mode: 0o040755, ..Default::default() },
            text_encoding: 0,
        };
        let bytes = encode_folder_record(&folder);
        assert_eq!(bytes.len(), 88);
        match parse_catalog_record(&bytes).unwrap() {
            CatalogRecord::Folder(back) => assert_eq!(back, folder),
            other => panic!("expected folder, got {:?}", other),
        }
    }

    #[test]
    fn test_file_record_roundtrip() {
        let mut file = CatalogFile {
            file_id: 25,
            create_date: 1,
            content_mod_date: 2,
            ..Default::default()
        };
        file.data_fork.logical_size = 8192;
        file.data_fork.total_blocks = 2;
        file.data_fork.extents[0] =
            crate::volume::ExtentDescriptor { start_block: 100, block_count: 2 };
        let bytes = encode_file_record(&file);
        assert_eq!(bytes.len(), 248);
        match parse_catalog_record(&bytes).unwrap() {
            CatalogRecord::File(back) => assert_eq!(back, file),
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_thread_record_roundtrip() {
        let name = unicode::string_to_units("Untitled");
        let bytes = encode_thread_record(true, CNID_ROOT_PARENT, &name);
        match parse_catalog_record(&bytes).unwrap() {
            CatalogRecord::FolderThread(t) => {
                assert_eq!(t.parent_id, CNID_ROOT_PARENT);
                assert_eq!(t.node_name, name);
            }
            other => panic!("expected folder thread, got {:?}", other),
        }
    }

    #[test]
    fn test_hfs_key_roundtrip_and_padding() {
        // Even name length forces a pad byte.
        let encoded = encode_hfs_catalog_key(1, b"Test");
        assert_eq!(encoded.len() % 2, 0);
        let (key, payload) = parse_hfs_catalog_key(&encoded).unwrap();
        assert_eq!(key.parent_id, 1);
        assert_eq!(key.name, b"Test");
        assert_eq!(payload, encoded.len());

        // Odd name length needs no pad.
        let encoded = encode_hfs_catalog_key(1, b"Tes");
        assert_eq!(encoded.len() % 2, 0);
        let (_, payload) = parse_hfs_catalog_key(&encoded).unwrap();
        assert_eq!(payload, encoded.len());
    }

    #[test]
    fn test_hfs_dir_and_thread_roundtrip() {
        let dir = HfsCatalogDir {
            flags: 0,
            valence: 0,
            dir_id: 2,
            create_date: 7,
            modify_date: 8,
            backup_date: 0,
        };
        match parse_hfs_catalog_record(&encode_hfs_dir_record(&dir)).unwrap() {
            HfsCatalogRecord::Dir(back) => assert_eq!(back, dir),
            other => panic!("expected dir, got {:?}", other),
        }

        let bytes = encode_hfs_thread_record(true, 1, b"Volume");
        assert_eq!(bytes.len(), 46);
        match parse_hfs_catalog_record(&bytes).unwrap() {
            HfsCatalogRecord::DirThread(t) => {
                assert_eq!(t.parent_id, 1);
                assert_eq!(t.name, b"Volume");
            }
            other => panic!("expected dir thread, got {:?}", other),
        }
    }

    #[test]
    fn test_hfs_file_record_roundtrip() {
        let mut file = HfsCatalogFile {
            file_id: 30,
            data_logical_size: 1000,
            data_physical_size: 1024,
            create_date: 5,
            modify_date: 6,
            ..Default::default()
        };
        file.file_type = *b"TEXT";
        file.creator = *b"ttxt";
        file.data_extents[0] = crate::mdb::HfsExtent { start_block: 9, block_count: 2 };
        match parse_hfs_catalog_record(&encode_hfs_file_record(&file)).unwrap() {
            HfsCatalogRecord::File(back) => assert_eq!(back, file),
            other => panic!("expected file, got {:?}", other),
        }
    }
}
