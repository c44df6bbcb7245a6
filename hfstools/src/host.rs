//! Host-side checks: mount-table lookups and device opening.

use std::fs::{File, OpenOptions};
use std::path::Path;

/// Whether the device path appears as a mount source in the host's mount
/// table. Opening a mounted device for write is never allowed.
pub(crate) fn is_mounted(device: &str) -> bool {
    let table = match std::fs::read_to_string("/proc/mounts") {
        Ok(t) => t,
        Err(_) => return false,
    };
    table
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| source == device)
}

pub(crate) fn open_read_only(path: &str) -> std::io::Result<File> {
    File::open(path)
}

pub(crate) fn open_read_write(path: &str) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Create or grow a regular file to exactly `size` bytes (disk images are a
/// first-class formatting target).
pub(crate) fn create_image(path: &str, size: u64) -> std::io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

pub(crate) fn is_directory(path: &str) -> bool {
    Path::new(path).is_dir()
}
