//! Filesystem discrimination and HFS time handling.
//!
//! Both volume formats advertise themselves with a two-byte big-endian
//! signature at byte offset 1024. Timestamps are seconds since 1904-01-01
//! and overflow on 2040-02-06; every timestamp this crate writes is clamped
//! well below that limit.

use std::io::{Read, Seek, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::mdb::HFS_SIGNATURE;
use crate::volume::{HFSX_SIGNATURE, HFS_PLUS_SIGNATURE, VOLUME_HEADER_OFFSET};

/// Seconds between the HFS epoch (1904-01-01) and the Unix epoch.
pub const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Last representable HFS timestamp (2040-02-06).
pub const HFS_MAX_TIME: u32 = 0xFFFF_FFFF;

/// Safety margin below `HFS_MAX_TIME` for freshly written timestamps, about
/// ten years. Prevents Y2K40 wrap-around on volumes formatted near the end
/// of the representable range.
const SAFE_TIME_MARGIN: u32 = 315_360_000;

/// The filesystem variants this suite understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// Classic HFS ("BD").
    Hfs,
    /// HFS Plus, case-insensitive ("H+").
    HfsPlus,
    /// HFS Plus, case-sensitive ("HX").
    Hfsx,
}

impl FsKind {
    pub fn is_plus(self) -> bool {
        matches!(self, FsKind::HfsPlus | FsKind::Hfsx)
    }

    pub fn name(self) -> &'static str {
        match self {
            FsKind::Hfs => "HFS",
            FsKind::HfsPlus => "HFS+",
            FsKind::Hfsx => "HFSX",
        }
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Read the two signature bytes at offset 1024 and classify the volume.
/// `Ok(None)` means the device is readable but carries no known signature.
pub fn probe<D: Read + Write + Seek>(dev: &mut BlockDevice<D>) -> Result<Option<FsKind>> {
    let mut sig = [0u8; 2];
    dev.read_at(VOLUME_HEADER_OFFSET, &mut sig)
        .map_err(|_| HfsError::NotAFilesystem)?;

    Ok(match u16::from_be_bytes(sig) {
        HFS_SIGNATURE => Some(FsKind::Hfs),
        HFS_PLUS_SIGNATURE => Some(FsKind::HfsPlus),
        HFSX_SIGNATURE => Some(FsKind::Hfsx),
        _ => None,
    })
}

/// Current time in the HFS epoch, clamped to `HFS_MAX_TIME - 10y`.
pub fn now_hfs() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    unix_to_hfs(unix)
}

/// Convert a Unix timestamp to a clamped HFS timestamp.
pub fn unix_to_hfs(unix: i64) -> u32 {
    let hfs = unix.saturating_add(HFS_EPOCH_OFFSET);
    let ceiling = (HFS_MAX_TIME - SAFE_TIME_MARGIN) as i64;
    hfs.clamp(0, ceiling) as u32
}

/// Convert an HFS timestamp to Unix seconds.
pub fn hfs_to_unix(hfs: u32) -> i64 {
    hfs as i64 - HFS_EPOCH_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_with_signature(sig: u16) -> BlockDevice<Cursor<Vec<u8>>> {
        let mut bytes = vec![0u8; 2048];
        bytes[1024..1026].copy_from_slice(&sig.to_be_bytes());
        BlockDevice::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_probe_variants() {
        assert_eq!(probe(&mut image_with_signature(0x4244)).unwrap(), Some(FsKind::Hfs));
        assert_eq!(probe(&mut image_with_signature(0x482B)).unwrap(), Some(FsKind::HfsPlus));
        assert_eq!(probe(&mut image_with_signature(0x4858)).unwrap(), Some(FsKind::Hfsx));
        assert_eq!(probe(&mut image_with_signature(0xBEEF)).unwrap(), None);
    }

    #[test]
    fn test_probe_too_small_device() {
        let mut dev = BlockDevice::new(Cursor::new(vec![0u8; 512])).unwrap();
        assert!(matches!(probe(&mut dev), Err(HfsError::NotAFilesystem)));
    }

    #[test]
    fn test_time_clamping() {
        // A date far past 2040 must clamp below the HFS ceiling.
        let clamped = unix_to_hfs(i64::MAX);
        assert_eq!(clamped, HFS_MAX_TIME - SAFE_TIME_MARGIN);

        // An ordinary date survives the round trip.
        let unix = 1_600_000_000i64;
        assert_eq!(hfs_to_unix(unix_to_hfs(unix)), unix);
    }

    #[test]
    fn test_max_time_serializes() {
        assert_eq!(hfs_to_unix(HFS_MAX_TIME), HFS_MAX_TIME as i64 - HFS_EPOCH_OFFSET);
    }
}
