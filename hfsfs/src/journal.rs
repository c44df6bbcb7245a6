//! HFS+ journal validation, replay, and disable.
//!
//! The journal info block (located by `VH.journal_info_block`) points at a
//! circular journal area. The journal header tracks `start`/`end` byte
//! offsets within that area; a transaction is a block-list header followed
//! by block-info records, each followed by its replacement payload. All
//! checksums are 32-bit big-endian word sums with the checksum field zeroed
//! during computation — not CRCs.

use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Seek, Write};

use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::volume::{self, VolumeHeader, ATTR_JOURNALED};

pub const JOURNAL_MAGIC: u32 = 0x4A4E_4C78;
/// Endian sentinel; anything else means a mismatched-endian disk.
pub const JOURNAL_ENDIAN: u32 = 0x1234_5678;

// Journal info block flags.
pub const JIB_ON_OTHER_DEVICE: u32 = 1 << 0;
pub const JIB_NEEDS_INIT: u32 = 1 << 1;

pub const JOURNAL_HEADER_SIZE: usize = 44;
pub const BLOCK_LIST_HEADER_SIZE: usize = 40;
pub const BLOCK_INFO_SIZE: usize = 20;

/// Transactions processed before replay declares the journal corrupt.
pub const MAX_TRANSACTIONS: u32 = 1000;

/// Block-info records allowed per transaction.
const MAX_BLOCKS_PER_TRANSACTION: u16 = 1000;

/// The journal info block stored at `journal_info_block * block_size`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalInfoBlock {
    pub flags: u32,
    pub device_signature: [u32; 8],
    /// Byte offset of the journal area on the volume.
    pub offset: u64,
    /// Byte size of the journal area.
    pub size: u64,
}

impl JournalInfoBlock {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 52 {
            return Err(HfsError::InvalidJournal("info block too short".into()));
        }
        let mut device_signature = [0u32; 8];
        for (i, sig) in device_signature.iter_mut().enumerate() {
            *sig = BigEndian::read_u32(&buf[4 + i * 4..]);
        }
        Ok(JournalInfoBlock {
            flags: BigEndian::read_u32(&buf[0..]),
            device_signature,
            offset: BigEndian::read_u64(&buf[36..]),
            size: BigEndian::read_u64(&buf[44..]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        BigEndian::write_u32(&mut buf[0..], self.flags);
        for (i, sig) in self.device_signature.iter().enumerate() {
            BigEndian::write_u32(&mut buf[4 + i * 4..], *sig);
        }
        BigEndian::write_u64(&mut buf[36..], self.offset);
        BigEndian::write_u64(&mut buf[44..], self.size);
    }
}

/// The journal header at the start of the journal area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub endian: u32,
    /// Byte offset of the oldest unreplayed transaction, within the area.
    pub start: u64,
    /// Byte offset past the newest transaction, within the area.
    pub end: u64,
    /// Byte size of the journal area.
    pub size: u64,
    pub blhdr_size: u32,
    pub checksum: u32,
    pub jhdr_size: u32,
}

impl JournalHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < JOURNAL_HEADER_SIZE {
            return Err(HfsError::InvalidJournal("journal header too short".into()));
        }
        Ok(JournalHeader {
            magic: BigEndian::read_u32(&buf[0..]),
            endian: BigEndian::read_u32(&buf[4..]),
            start: BigEndian::read_u64(&buf[8..]),
            end: BigEndian::read_u64(&buf[16..]),
            size: BigEndian::read_u64(&buf[24..]),
            blhdr_size: BigEndian::read_u32(&buf[32..]),
            checksum: BigEndian::read_u32(&buf[36..]),
            jhdr_size: BigEndian::read_u32(&buf[40..]),
        })
    }

    pub fn encode(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..], self.magic);
        BigEndian::write_u32(&mut buf[4..], self.endian);
        BigEndian::write_u64(&mut buf[8..], self.start);
        BigEndian::write_u64(&mut buf[16..], self.end);
        BigEndian::write_u64(&mut buf[24..], self.size);
        BigEndian::write_u32(&mut buf[32..], self.blhdr_size);
        BigEndian::write_u32(&mut buf[36..], self.checksum);
        BigEndian::write_u32(&mut buf[40..], self.jhdr_size);
        buf
    }

    /// Recompute and store the header checksum.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.encode());
    }
}

/// One block-list header; `num_blocks` block-info records follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockListHeader {
    /// Capacity of this block list. Read, not enforced.
    pub bsize: u16,
    pub num_blocks: u16,
    pub checksum: u32,
}

impl BlockListHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_LIST_HEADER_SIZE {
            return Err(HfsError::InvalidJournal("block list header too short".into()));
        }
        Ok(BlockListHeader {
            bsize: BigEndian::read_u16(&buf[0..]),
            num_blocks: BigEndian::read_u16(&buf[2..]),
            checksum: BigEndian::read_u32(&buf[4..]),
        })
    }

    pub fn encode(&self) -> [u8; BLOCK_LIST_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_LIST_HEADER_SIZE];
        BigEndian::write_u16(&mut buf[0..], self.bsize);
        BigEndian::write_u16(&mut buf[2..], self.num_blocks);
        BigEndian::write_u32(&mut buf[4..], self.checksum);
        buf
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.encode());
    }
}

/// One journaled block: target block number, payload size, and the journal
/// offset of the next entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub bnum: u64,
    pub bsize: u32,
    pub next: u64,
}

impl BlockInfo {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_INFO_SIZE {
            return Err(HfsError::InvalidJournal("block info too short".into()));
        }
        Ok(BlockInfo {
            bnum: BigEndian::read_u64(&buf[0..]),
            bsize: BigEndian::read_u32(&buf[8..]),
            next: BigEndian::read_u64(&buf[12..]),
        })
    }

    pub fn encode(&self) -> [u8; BLOCK_INFO_SIZE] {
        let mut buf = [0u8; BLOCK_INFO_SIZE];
        BigEndian::write_u64(&mut buf[0..], self.bnum);
        BigEndian::write_u32(&mut buf[8..], self.bsize);
        BigEndian::write_u64(&mut buf[12..], self.next);
        buf
    }
}

/// 32-bit big-endian word sum. Trailing bytes that do not fill a word are
/// ignored, matching the on-disk convention.
pub fn checksum(data: &[u8]) -> u32 {
    data.chunks_exact(4)
        .fold(0u32, |sum, w| sum.wrapping_add(BigEndian::read_u32(w)))
}

/// A validated journal: info block, header, and the journal area's device
/// offset.
#[derive(Debug, Clone)]
pub struct Journal {
    pub info: JournalInfoBlock,
    pub header: JournalHeader,
    pub base: u64,
}

impl Journal {
    pub fn is_clean(&self) -> bool {
        self.header.start == self.header.end
    }
}

/// Validate the journal referenced by a volume header. Any failure is
/// terminal for the journal phase.
pub fn validate<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    vh: &VolumeHeader,
) -> Result<Journal> {
    if vh.journal_info_block == 0 {
        return Err(HfsError::InvalidJournal("journal info block is zero".into()));
    }
    if vh.journal_info_block >= vh.total_blocks {
        return Err(HfsError::InvalidJournal("journal info block beyond volume end".into()));
    }

    let mut jib_buf = vec![0u8; vh.block_size as usize];
    dev.read_at(vh.journal_info_block as u64 * vh.block_size as u64, &mut jib_buf)?;
    let info = JournalInfoBlock::decode(&jib_buf)?;

    if info.flags & JIB_ON_OTHER_DEVICE != 0 {
        return Err(HfsError::InvalidJournal("external journal not supported".into()));
    }
    if info.flags & JIB_NEEDS_INIT != 0 {
        return Err(HfsError::InvalidJournal("journal needs initialization".into()));
    }
    if info.offset == 0 || info.size == 0 {
        return Err(HfsError::InvalidJournal("journal offset or size is zero".into()));
    }
    let volume_size = vh.total_blocks as u64 * vh.block_size as u64;
    if info.offset + info.size > volume_size {
        return Err(HfsError::InvalidJournal("journal extends beyond volume end".into()));
    }

    let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
    dev.read_at(info.offset, &mut header_buf)?;
    let header = JournalHeader::decode(&header_buf)?;

    if header.magic != JOURNAL_MAGIC {
        return Err(HfsError::InvalidJournal(format!(
            "bad journal magic 0x{:08X}",
            header.magic
        )));
    }
    if header.endian != JOURNAL_ENDIAN {
        return Err(HfsError::InvalidJournal(format!(
            "bad journal endianness 0x{:08X}",
            header.endian
        )));
    }
    if header.size != info.size {
        return Err(HfsError::InvalidJournal(
            "journal header size disagrees with info block".into(),
        ));
    }
    if header.start > header.size || header.end > header.size {
        return Err(HfsError::InvalidJournal(
            "journal start/end pointers beyond journal size".into(),
        ));
    }
    if header.blhdr_size != BLOCK_LIST_HEADER_SIZE as u32 {
        return Err(HfsError::InvalidJournal(format!(
            "block list header size {} (expected {})",
            header.blhdr_size, BLOCK_LIST_HEADER_SIZE
        )));
    }
    if header.jhdr_size != 0 && header.jhdr_size != JOURNAL_HEADER_SIZE as u32 {
        return Err(HfsError::InvalidJournal(format!(
            "journal header size field {} (expected {})",
            header.jhdr_size, JOURNAL_HEADER_SIZE
        )));
    }

    let mut unsealed = header.clone();
    unsealed.checksum = 0;
    let computed = checksum(&unsealed.encode());
    if computed != header.checksum {
        return Err(HfsError::InvalidJournal(format!(
            "journal header checksum mismatch: stored 0x{:08X}, computed 0x{:08X}",
            header.checksum, computed
        )));
    }

    let base = info.offset;
    Ok(Journal { info, header, base })
}

/// Read from the circular journal area, wrapping from `size` back to the
/// space after the journal header.
fn read_circular<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    journal: &Journal,
    pos: &mut u64,
    buf: &mut [u8],
) -> Result<()> {
    let size = journal.header.size;
    let mut done = 0usize;
    while done < buf.len() {
        if *pos >= size {
            *pos = JOURNAL_HEADER_SIZE as u64;
        }
        let run = ((size - *pos) as usize).min(buf.len() - done);
        dev.read_at(journal.base + *pos, &mut buf[done..done + run])?;
        done += run;
        *pos += run as u64;
    }
    Ok(())
}

fn wrap(journal: &Journal, pos: u64) -> u64 {
    if pos >= journal.header.size {
        JOURNAL_HEADER_SIZE as u64
    } else {
        pos
    }
}

/// Replay pending transactions onto the volume.
///
/// With `apply` false the walk validates the transaction chain without
/// touching the volume. With `apply` true each payload is written at its
/// absolute target block, the journal header's `start` is advanced to `end`,
/// and everything is synced. Replay is idempotent: block infos carry
/// absolute targets, so replaying a completed transaction rewrites identical
/// bytes. Returns the number of transactions processed.
pub fn replay<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    vh: &VolumeHeader,
    journal: &mut Journal,
    apply: bool,
) -> Result<u32> {
    let end = journal.header.end;
    if journal.header.start == end {
        return Ok(0);
    }

    log::info!(
        "replaying journal transactions (start={}, end={})",
        journal.header.start,
        end
    );

    let mut pos = journal.header.start;
    let mut transactions = 0u32;

    while pos != end {
        transactions += 1;
        if transactions > MAX_TRANSACTIONS {
            return Err(HfsError::InvalidJournal(
                "too many transactions, journal is corrupt".into(),
            ));
        }

        let mut blh_buf = [0u8; BLOCK_LIST_HEADER_SIZE];
        let mut p = pos;
        read_circular(dev, journal, &mut p, &mut blh_buf)?;
        let blh = BlockListHeader::decode(&blh_buf)?;

        let mut unsealed = blh_buf;
        BigEndian::write_u32(&mut unsealed[4..], 0);
        let computed = checksum(&unsealed);
        if computed != blh.checksum {
            return Err(HfsError::InvalidJournal(format!(
                "block list checksum mismatch: stored 0x{:08X}, computed 0x{:08X}",
                blh.checksum, computed
            )));
        }
        if blh.num_blocks == 0 || blh.num_blocks > MAX_BLOCKS_PER_TRANSACTION {
            return Err(HfsError::InvalidJournal(format!(
                "transaction block count {}",
                blh.num_blocks
            )));
        }

        for _ in 0..blh.num_blocks {
            let mut bi_buf = [0u8; BLOCK_INFO_SIZE];
            read_circular(dev, journal, &mut p, &mut bi_buf)?;
            let bi = BlockInfo::decode(&bi_buf)?;

            if bi.bsize == 0 || bi.bsize > vh.block_size * 8 {
                return Err(HfsError::InvalidJournal(format!(
                    "journaled block size {}",
                    bi.bsize
                )));
            }
            if bi.bnum >= vh.total_blocks as u64 {
                return Err(HfsError::InvalidJournal(format!(
                    "journaled block number {} beyond volume end",
                    bi.bnum
                )));
            }

            let mut payload = vec![0u8; bi.bsize as usize];
            read_circular(dev, journal, &mut p, &mut payload)?;
            if apply {
                dev.write_at(bi.bnum * vh.block_size as u64, &payload)?;
                log::debug!("replayed block {} ({} bytes)", bi.bnum, bi.bsize);
            }
            p = wrap(journal, bi.next);
        }
        pos = p;
    }

    if apply && transactions > 0 {
        journal.header.start = end;
        journal.header.seal();
        dev.write_at(journal.base, &journal.header.encode())?;
        dev.sync()?;
    }

    log::info!("journal replay completed: {} transaction(s)", transactions);
    Ok(transactions)
}

/// Disable journaling: clear the attribute bit, zero the info-block pointer,
/// write both header copies. The journal area itself is not reclaimed; its
/// blocks stay marked used until a later reformat.
pub fn disable<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    vh: &mut VolumeHeader,
) -> Result<()> {
    vh.attributes &= !ATTR_JOURNALED;
    vh.journal_info_block = 0;
    volume::write_both(dev, vh)?;
    log::warn!("journaling disabled");
    Ok(())
}

/// Write a pristine journal: info block at `jib_offset`, clean header at
/// `journal_offset`. Used by the formatter.
pub fn initialize<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    block_size: u32,
    jib_offset: u64,
    journal_offset: u64,
    journal_size: u64,
) -> Result<()> {
    let info = JournalInfoBlock {
        flags: 0,
        device_signature: [0; 8],
        offset: journal_offset,
        size: journal_size,
    };
    let mut jib_buf = vec![0u8; block_size as usize];
    info.encode(&mut jib_buf);
    dev.write_at(jib_offset, &jib_buf)?;

    let mut header = JournalHeader {
        magic: JOURNAL_MAGIC,
        endian: JOURNAL_ENDIAN,
        start: JOURNAL_HEADER_SIZE as u64,
        end: JOURNAL_HEADER_SIZE as u64,
        size: journal_size,
        blhdr_size: BLOCK_LIST_HEADER_SIZE as u32,
        checksum: 0,
        jhdr_size: JOURNAL_HEADER_SIZE as u32,
    };
    header.seal();
    dev.write_at(journal_offset, &header.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_word_sum_checksum() {
        assert_eq!(checksum(&[0, 0, 0, 1, 0, 0, 0, 2]), 3);
        // Trailing partial word is ignored.
        assert_eq!(checksum(&[0, 0, 0, 1, 0xFF]), 1);
        // Wrapping, not saturating.
        assert_eq!(checksum(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 2]), 1);
    }

    #[test]
    fn test_header_roundtrip_and_seal() {
        let mut header = JournalHeader {
            magic: JOURNAL_MAGIC,
            endian: JOURNAL_ENDIAN,
            start: 44,
            end: 44,
            size: 1 << 20,
            blhdr_size: BLOCK_LIST_HEADER_SIZE as u32,
            checksum: 0,
            jhdr_size: JOURNAL_HEADER_SIZE as u32,
        };
        header.seal();
        let back = JournalHeader::decode(&header.encode()).unwrap();
        assert_eq!(back, header);

        let mut unsealed = back.clone();
        unsealed.checksum = 0;
        assert_eq!(checksum(&unsealed.encode()), header.checksum);
    }

    #[test]
    fn test_info_block_roundtrip() {
        let info = JournalInfoBlock {
            flags: 0,
            device_signature: [7; 8],
            offset: 0x8000,
            size: 0x10_0000,
        };
        let mut buf = vec![0u8; 512];
        info.encode(&mut buf);
        assert_eq!(JournalInfoBlock::decode(&buf).unwrap(), info);
    }

    #[test]
    fn test_block_info_roundtrip() {
        let bi = BlockInfo { bnum: 42, bsize: 512, next: 1024 };
        assert_eq!(BlockInfo::decode(&bi.encode()).unwrap(), bi);
    }

    /// Fabricate a minimal journaled volume: header fields only, a journal
    /// area, and one single-block transaction.
    fn journaled_volume(
        payload: &[u8],
        target_block: u64,
    ) -> (BlockDevice<Cursor<Vec<u8>>>, VolumeHeader, Journal) {
        let block_size = 512u32;
        let total_blocks = 256u32;
        let journal_block = 64u64;
        let journal_offset = journal_block * block_size as u64;
        let journal_size = 32 * 512u64;

        let mut vh = crate::volume::tests::sample();
        vh.block_size = block_size;
        vh.total_blocks = total_blocks;
        vh.attributes |= ATTR_JOURNALED;
        vh.journal_info_block = 16;

        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 256 * 512])).unwrap();
        initialize(
            &mut dev,
            block_size,
            16 * block_size as u64,
            journal_offset,
            journal_size,
        )
        .unwrap();

        // Append one transaction at the clean journal's end.
        let jh_size = JOURNAL_HEADER_SIZE as u64;
        let tx_start = jh_size;
        let bi_at = tx_start + BLOCK_LIST_HEADER_SIZE as u64;
        let payload_at = bi_at + BLOCK_INFO_SIZE as u64;
        let tx_end = payload_at + payload.len() as u64;

        let mut blh = BlockListHeader {
            bsize: 0x1000,
            num_blocks: 1,
            checksum: 0,
        };
        blh.seal();
        dev.write_at(journal_offset + tx_start, &blh.encode()).unwrap();

        let bi = BlockInfo {
            bnum: target_block,
            bsize: payload.len() as u32,
            next: tx_end,
        };
        dev.write_at(journal_offset + bi_at, &bi.encode()).unwrap();
        dev.write_at(journal_offset + payload_at, payload).unwrap();

        let mut header = JournalHeader {
            magic: JOURNAL_MAGIC,
            endian: JOURNAL_ENDIAN,
            start: tx_start,
            end: tx_end,
            size: journal_size,
            blhdr_size: BLOCK_LIST_HEADER_SIZE as u32,
            checksum: 0,
            jhdr_size: JOURNAL_HEADER_SIZE as u32,
        };
        header.seal();
        dev.write_at(journal_offset, &header.encode()).unwrap();

        let journal = validate(&mut dev, &vh).unwrap();
        (dev, vh, journal)
    }

    #[test]
    fn test_clean_journal_replay_is_noop() {
        let block_size = 512u32;
        let mut vh = crate::volume::tests::sample();
        vh.block_size = block_size;
        vh.total_blocks = 256;
        vh.attributes |= ATTR_JOURNALED;
        vh.journal_info_block = 16;

        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 256 * 512])).unwrap();
        initialize(&mut dev, block_size, 16 * 512, 64 * 512, 32 * 512).unwrap();

        let mut journal = validate(&mut dev, &vh).unwrap();
        assert!(journal.is_clean());
        assert_eq!(replay(&mut dev, &vh, &mut journal, true).unwrap(), 0);
    }

    #[test]
    fn test_replay_applies_payload_and_advances_start() {
        let payload = vec![0xA5u8; 512];
        let (mut dev, vh, mut journal) = journaled_volume(&payload, 200);

        let replayed = replay(&mut dev, &vh, &mut journal, true).unwrap();
        assert_eq!(replayed, 1);

        let mut block = vec![0u8; 512];
        dev.read_at(200 * 512, &mut block).unwrap();
        assert_eq!(block, payload);

        // The on-disk header must now be clean with start advanced to end.
        let reloaded = validate(&mut dev, &vh).unwrap();
        assert!(reloaded.is_clean());
        assert_eq!(reloaded.header.start, journal.header.end);
    }

    #[test]
    fn test_replay_without_apply_leaves_volume_untouched() {
        let payload = vec![0x5Au8; 512];
        let (mut dev, vh, mut journal) = journaled_volume(&payload, 200);

        replay(&mut dev, &vh, &mut journal, false).unwrap();
        let mut block = vec![0u8; 512];
        dev.read_at(200 * 512, &mut block).unwrap();
        assert_eq!(block, vec![0u8; 512]);
    }

    #[test]
    fn test_corrupt_block_list_checksum_rejected() {
        let payload = vec![1u8; 512];
        let (mut dev, vh, mut journal) = journaled_volume(&payload, 10);

        // Flip a byte inside the block list header.
        let blh_at = journal.base + JOURNAL_HEADER_SIZE as u64;
        dev.write_at(blh_at + 2, &[0xFF]).unwrap();
        assert!(matches!(
            replay(&mut dev, &vh, &mut journal, true),
            Err(HfsError::InvalidJournal(_))
        ));
    }

    #[test]
    fn test_bad_magic_fails_validation() {
        let (mut dev, vh, journal) = journaled_volume(&[0u8; 512], 10);
        dev.write_at(journal.base, &[0u8; 4]).unwrap();
        assert!(matches!(validate(&mut dev, &vh), Err(HfsError::InvalidJournal(_))));
    }

    #[test]
    fn test_wrap_around_payload_replays() {
        // Build a transaction whose payload crosses the journal-size
        // boundary and wraps to just past the journal header.
        let block_size = 512u32;
        let journal_offset = 64 * 512u64;
        let journal_size = 8 * 512u64; // 4096

        let mut vh = crate::volume::tests::sample();
        vh.block_size = block_size;
        vh.total_blocks = 256;
        vh.attributes |= ATTR_JOURNALED;
        vh.journal_info_block = 16;

        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 256 * 512])).unwrap();
        initialize(&mut dev, block_size, 16 * 512, journal_offset, journal_size).unwrap();

        // Transaction begins 100 bytes before the boundary.
        let tx_start = journal_size - 100;
        let bi_at = tx_start + BLOCK_LIST_HEADER_SIZE as u64; // still below size
        let payload_at = bi_at + BLOCK_INFO_SIZE as u64; // 40 bytes left before wrap
        let payload: Vec<u8> = (0..512u32).map(|i| i as u8).collect();

        let first_part = (journal_size - payload_at) as usize;
        let wrapped_rest = payload.len() - first_part;
        let next = JOURNAL_HEADER_SIZE as u64 + wrapped_rest as u64;

        let mut blh = BlockListHeader { bsize: 0x1000, num_blocks: 1, checksum: 0 };
        blh.seal();
        dev.write_at(journal_offset + tx_start, &blh.encode()).unwrap();

        let bi = BlockInfo { bnum: 99, bsize: payload.len() as u32, next };
        dev.write_at(journal_offset + bi_at, &bi.encode()).unwrap();
        dev.write_at(journal_offset + payload_at, &payload[..first_part]).unwrap();
        dev.write_at(
            journal_offset + JOURNAL_HEADER_SIZE as u64,
            &payload[first_part..],
        )
        .unwrap();

        let mut header = JournalHeader {
            magic: JOURNAL_MAGIC,
            endian: JOURNAL_ENDIAN,
            start: tx_start,
            end: next,
            size: journal_size,
            blhdr_size: BLOCK_LIST_HEADER_SIZE as u32,
            checksum: 0,
            jhdr_size: JOURNAL_HEADER_SIZE as u32,
        };
        header.seal();
        dev.write_at(journal_offset, &header.encode()).unwrap();

        let mut journal = validate(&mut dev, &vh).unwrap();
        assert_eq!(replay(&mut dev, &vh, &mut journal, true).unwrap(), 1);

        let mut block = vec![0u8; 512];
        dev.read_at(99 * 512, &mut block).unwrap();
        assert_eq!(block, payload);
    }
}
