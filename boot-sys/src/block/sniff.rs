// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem signature sniffing
//!
//! Only the handful of families a boot partition realistically uses are
//! recognized. Everything is read from fixed offsets in the first few KiB.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use boot_types::FsType;

/// Bytes needed to see every supported superblock.
pub const SNIFF_LEN: usize = 4096;

const FAT32_MAGIC: &[u8; 8] = b"FAT32   ";
const FAT32_MAGIC_OFF: usize = 0x52;
const FAT32_ID_OFF: usize = 0x43;

const FAT16_MAGIC: &[u8; 8] = b"FAT16   ";
const FAT12_MAGIC: &[u8; 8] = b"FAT12   ";
const FAT16_MAGIC_OFF: usize = 0x36;
const FAT16_ID_OFF: usize = 0x27;

const EXT_SUPERBLOCK_OFF: usize = 1024;
const EXT_MAGIC_OFF: usize = 56;
const EXT_UUID_OFF: usize = 104;
const EXT_MAGIC: u16 = 0xEF53;

const XFS_MAGIC: &[u8; 4] = b"XFSB";
const XFS_UUID_OFF: usize = 32;

/// Reads the head of `path` and identifies its filesystem.
pub fn sniff_path(path: &Path) -> io::Result<Option<(FsType, String)>> {
    let file = File::open(path)?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], filled as u64)? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(sniff(&buf))
}

/// Identifies a filesystem from its first bytes.
///
/// FAT is checked before ext because a FAT boot sector can legitimately carry
/// arbitrary data at the ext magic offset.
pub fn sniff(buf: &[u8]) -> Option<(FsType, String)> {
    try_fat32(buf)
        .or_else(|| try_fat16(buf))
        .map(|id| (FsType::Vfat, id))
        .or_else(|| try_ext(buf).map(|id| (FsType::Ext4, id)))
        .or_else(|| try_xfs(buf).map(|id| (FsType::Xfs, id)))
}

fn slice(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buf.get(offset..offset.checked_add(len)?)
}

fn fat_serial(id: &[u8]) -> String {
    format!("{:02x}{:02x}-{:02x}{:02x}", id[3], id[2], id[1], id[0])
}

fn try_fat32(buf: &[u8]) -> Option<String> {
    if slice(buf, FAT32_MAGIC_OFF, 8)? != FAT32_MAGIC {
        return None;
    }
    slice(buf, FAT32_ID_OFF, 4).map(fat_serial)
}

fn try_fat16(buf: &[u8]) -> Option<String> {
    let magic = slice(buf, FAT16_MAGIC_OFF, 8)?;
    if magic != FAT16_MAGIC && magic != FAT12_MAGIC {
        return None;
    }
    slice(buf, FAT16_ID_OFF, 4).map(fat_serial)
}

fn uuid_string(b: &[u8]) -> String {
    let hex = |bytes: &[u8]| bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!(
        "{}-{}-{}-{}-{}",
        hex(&b[0..4]),
        hex(&b[4..6]),
        hex(&b[6..8]),
        hex(&b[8..10]),
        hex(&b[10..16])
    )
}

fn try_ext(buf: &[u8]) -> Option<String> {
    let magic = slice(buf, EXT_SUPERBLOCK_OFF + EXT_MAGIC_OFF, 2)?;
    if u16::from_le_bytes([magic[0], magic[1]]) != EXT_MAGIC {
        return None;
    }
    slice(buf, EXT_SUPERBLOCK_OFF + EXT_UUID_OFF, 16).map(uuid_string)
}

fn try_xfs(buf: &[u8]) -> Option<String> {
    if slice(buf, 0, 4)? != XFS_MAGIC {
        return None;
    }
    slice(buf, XFS_UUID_OFF, 16).map(uuid_string)
}
