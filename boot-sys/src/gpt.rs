// SPDX-License-Identifier: GPL-3.0-only

//! GUID partition table reading, validation and writing
//!
//! A table is only trusted when both copies pass their own structural and CRC
//! checks and agree with each other. Reads and writes go through `Read + Seek`
//! / `Write + Seek` so tests can run against an in-memory disk.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

use uuid::Uuid;

use crate::error::{Result, SysError};

/// "EFI PART" as a little-endian u64.
pub const SIGNATURE: u64 = 0x5452_4150_2049_4645;
pub const REVISION: u32 = 0x0001_0000;
pub const HEADER_SIZE: u32 = 0x5c;
pub const MAX_NPART: u32 = 0x80;
pub const ENTRY_SIZE: u32 = 0x80;
/// Largest partition entry accepted; keeps the array read bounded.
pub const MAX_ENTRY_SIZE: u32 = 0x1000;
pub const MBR_SIZE: usize = 512;
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// EFI System Partition type GUID.
pub const EFI_SYSTEM_PARTITION: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);

const NAME_LEN: usize = 72;

fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn guid(buf: &[u8], off: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[off..off + 16]);
    Uuid::from_bytes_le(b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub crc: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_lba: u64,
    pub last_lba: u64,
    pub disk_guid: Uuid,
    pub part_start: u64,
    pub n_part: u32,
    pub part_size: u32,
    pub part_crc: u32,
}

impl GptHeader {
    fn parse(buf: &[u8]) -> Self {
        Self {
            signature: le_u64(buf, 0),
            revision: le_u32(buf, 8),
            header_size: le_u32(buf, 12),
            crc: le_u32(buf, 16),
            reserved: le_u32(buf, 20),
            current_lba: le_u64(buf, 24),
            backup_lba: le_u64(buf, 32),
            first_lba: le_u64(buf, 40),
            last_lba: le_u64(buf, 48),
            disk_guid: guid(buf, 56),
            part_start: le_u64(buf, 72),
            n_part: le_u32(buf, 80),
            part_size: le_u32(buf, 84),
            part_crc: le_u32(buf, 88),
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.signature.to_le_bytes());
        buf[8..12].copy_from_slice(&self.revision.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.crc.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        buf[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        buf[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_lba.to_le_bytes());
        buf[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        buf[72..80].copy_from_slice(&self.part_start.to_le_bytes());
        buf[80..84].copy_from_slice(&self.n_part.to_le_bytes());
        buf[84..88].copy_from_slice(&self.part_size.to_le_bytes());
        buf[88..92].copy_from_slice(&self.part_crc.to_le_bytes());
        buf
    }

    fn compute_crc(self) -> u32 {
        let mut zeroed = self;
        zeroed.crc = 0;
        crc32fast::hash(&zeroed.to_bytes())
    }
}

/// One partition entry. The name is kept as raw UTF-16LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub part_type: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: [u8; NAME_LEN],
}

impl Partition {
    pub fn new(part_type: Uuid, unique_guid: Uuid, first_lba: u64, last_lba: u64) -> Self {
        Self {
            part_type,
            unique_guid,
            first_lba,
            last_lba,
            attributes: 0,
            name: [0; NAME_LEN],
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = [0; NAME_LEN];
        for (i, unit) in name.encode_utf16().take(NAME_LEN / 2).enumerate() {
            self.name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        self
    }

    /// An all-zero type GUID marks an unused slot.
    pub fn is_empty(&self) -> bool {
        self.part_type.is_nil()
    }

    /// Partition label, decoded up to the first NUL.
    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    fn parse(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[56..56 + NAME_LEN]);
        Self {
            part_type: guid(buf, 0),
            unique_guid: guid(buf, 16),
            first_lba: le_u64(buf, 32),
            last_lba: le_u64(buf, 40),
            attributes: le_u64(buf, 48),
            name,
        }
    }

    fn write_into(&self, buf: &mut [u8]) {
        buf[0..16].copy_from_slice(&self.part_type.to_bytes_le());
        buf[16..32].copy_from_slice(&self.unique_guid.to_bytes_le());
        buf[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        buf[56..56 + NAME_LEN].copy_from_slice(&self.name);
    }
}

/// One copy of the table: a header and its partition array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    pub header: GptHeader,
    pub partitions: Vec<Partition>,
}

impl Gpt {
    fn entries_bytes(&self) -> Vec<u8> {
        let size = self.header.part_size as usize;
        let mut buf = vec![0u8; size * self.header.n_part as usize];
        for (i, part) in self.partitions.iter().take(self.header.n_part as usize).enumerate() {
            part.write_into(&mut buf[i * size..(i + 1) * size]);
        }
        buf
    }

    /// Recomputes both CRCs after editing header fields or partitions.
    pub fn update_crcs(&mut self) {
        self.header.part_crc = crc32fast::hash(&self.entries_bytes());
        self.header.crc = self.header.compute_crc();
    }
}

impl fmt::Display for Gpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GPT disk {} lba {}..={} ({} entries)",
            self.header.disk_guid, self.header.first_lba, self.header.last_lba, self.header.n_part
        )?;
        for (i, part) in self.partitions.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            writeln!(
                f,
                "  {}: {} {} {}..={} {:?}",
                i + 1,
                part.part_type,
                part.unique_guid,
                part.first_lba,
                part.last_lba,
                part.name()
            )?;
        }
        Ok(())
    }
}

/// Protective MBR plus both GPT copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub mbr: Vec<u8>,
    pub primary: Gpt,
    pub backup: Gpt,
}

fn read_at<R: Read + Seek>(r: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.seek(SeekFrom::Start(offset))?;
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Byte offset of `lba`, or an error when it does not fit in a `u64`.
fn lba_offset(which: &str, field: &str, lba: u64, block_size: u64) -> Result<u64> {
    lba.checked_mul(block_size).ok_or_else(|| {
        SysError::InvalidGpt(format!(
            "{which} GPT {field} ({lba:x}) is out of range for block size {block_size}"
        ))
    })
}

/// Reads and validates one GPT copy whose header starts at byte `offset`.
///
/// The checks run in a fixed order and the first failure is reported.
pub fn read_gpt<R: Read + Seek>(r: &mut R, offset: u64, block_size: u64) -> Result<Gpt> {
    let raw = read_at(r, offset, HEADER_SIZE as usize)?;
    let header = GptHeader::parse(&raw);
    let which = if offset == block_size { "Primary" } else { "Backup" };

    if header.signature != SIGNATURE {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT signature invalid ({:x}), needs to be {SIGNATURE:x}",
            header.signature
        )));
    }
    if header.revision != REVISION {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT revision ({:x}) is not supported value ({REVISION:x})",
            header.revision
        )));
    }
    if header.header_size != HEADER_SIZE {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT HeaderSize ({:x}) is not supported value ({HEADER_SIZE:x})",
            header.header_size
        )));
    }
    if header.n_part > MAX_NPART {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT MaxNPart ({:x}) is above maximum of {MAX_NPART:x}",
            header.n_part
        )));
    }
    if (header.part_size as usize) < ENTRY_SIZE as usize {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT PartSize ({:x}) is below minimum of {ENTRY_SIZE:x}",
            header.part_size
        )));
    }

    if header.part_size > MAX_ENTRY_SIZE {
        return Err(SysError::InvalidGpt(format!(
            "{which} GPT PartSize ({:x}) is above maximum of {MAX_ENTRY_SIZE:x}",
            header.part_size
        )));
    }

    let array_len = header.n_part as usize * header.part_size as usize;
    let array_start = lba_offset(which, "PartStart", header.part_start, block_size)?;
    let array = read_at(r, array_start, array_len)?;
    let part_crc = crc32fast::hash(&array);
    if part_crc != header.part_crc {
        return Err(SysError::InvalidGpt(format!(
            "{which} Partition CRC: computed checksum is {part_crc:x}, header has {:x}",
            header.part_crc
        )));
    }

    let crc = header.compute_crc();
    if crc != header.crc {
        return Err(SysError::InvalidGpt(format!(
            "{which} Header CRC: computed checksum is {crc:x}, header has {:x}",
            header.crc
        )));
    }

    let partitions = array
        .chunks_exact(header.part_size as usize)
        .map(Partition::parse)
        .collect();

    Ok(Gpt { header, partitions })
}

/// Compares two header copies, reporting every differing field.
///
/// The primary's `current_lba` is checked against the backup's `backup_lba`.
/// CRCs and the array location legitimately differ and are skipped.
pub fn equal_header(p: &GptHeader, b: &GptHeader) -> Result<()> {
    let mut diffs = Vec::new();
    if p.signature != b.signature {
        diffs.push(format!(
            "p.Signature({:#x}) != b.Signature({:#x})",
            p.signature, b.signature
        ));
    }
    if p.revision != b.revision {
        diffs.push(format!("p.Revision({}) != b.Revision({})", p.revision, b.revision));
    }
    if p.header_size != b.header_size {
        diffs.push(format!(
            "p.HeaderSize({}) != b.HeaderSize({})",
            p.header_size, b.header_size
        ));
    }
    if p.current_lba != b.backup_lba {
        diffs.push(format!(
            "p.CurrentLBA({:#x}) != b.BackupLBA({:#x})",
            p.current_lba, b.backup_lba
        ));
    }
    if p.first_lba != b.first_lba {
        diffs.push(format!(
            "p.FirstLBA({:#x}) != b.FirstLBA({:#x})",
            p.first_lba, b.first_lba
        ));
    }
    if p.last_lba != b.last_lba {
        diffs.push(format!(
            "p.LastLBA({:#x}) != b.LastLBA({:#x})",
            p.last_lba, b.last_lba
        ));
    }
    if p.disk_guid != b.disk_guid {
        diffs.push(format!(
            "p.DiskGUID({}) != b.DiskGUID({})",
            p.disk_guid, b.disk_guid
        ));
    }
    if p.n_part != b.n_part {
        diffs.push(format!("p.NPart({}) != b.NPart({})", p.n_part, b.n_part));
    }
    if p.part_size != b.part_size {
        diffs.push(format!(
            "p.PartSize({}) != b.PartSize({})",
            p.part_size, b.part_size
        ));
    }
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(SysError::GptMismatch(diffs.join("; ")))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compares partition arrays entry by entry.
pub fn equal_parts(p: &Gpt, b: &Gpt) -> Result<()> {
    if p.header.n_part != b.header.n_part || p.partitions.len() != b.partitions.len() {
        return Err(SysError::GptMismatch(format!(
            "Primary Number of partitions ({}) differs from Backup ({})",
            p.partitions.len(),
            b.partitions.len()
        )));
    }

    let mut diffs = Vec::new();
    for (i, (pp, bp)) in p.partitions.iter().zip(&b.partitions).enumerate() {
        if pp.part_type != bp.part_type {
            diffs.push(format!(
                "Partition {i}: p.PartGUID({}) != b.PartGUID({})",
                pp.part_type, bp.part_type
            ));
        }
        if pp.unique_guid != bp.unique_guid {
            diffs.push(format!(
                "Partition {i}: p.UniqueGUID({}) != b.UniqueGUID({})",
                pp.unique_guid, bp.unique_guid
            ));
        }
        if pp.first_lba != bp.first_lba {
            diffs.push(format!(
                "Partition {i}: p.FirstLBA({:#x}) != b.FirstLBA({:#x})",
                pp.first_lba, bp.first_lba
            ));
        }
        if pp.last_lba != bp.last_lba {
            diffs.push(format!(
                "Partition {i}: p.LastLBA({:#x}) != b.LastLBA({:#x})",
                pp.last_lba, bp.last_lba
            ));
        }
        if pp.name != bp.name {
            diffs.push(format!(
                "Partition {i}: p.Name(0x{}) != b.Name(0x{})",
                hex(&pp.name),
                hex(&bp.name)
            ));
        }
    }
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(SysError::GptMismatch(diffs.join("; ")))
    }
}

impl PartitionTable {
    /// Reads the MBR, the primary at LBA 1 and the backup at its
    /// `backup_lba`, then cross-checks them.
    pub fn read<R: Read + Seek>(r: &mut R, block_size: u64) -> Result<Self> {
        let mbr = read_at(r, 0, MBR_SIZE)?;
        let primary = read_gpt(r, block_size, block_size)?;
        let backup_start = lba_offset("Primary", "AlternateLBA", primary.header.backup_lba, block_size)?;
        let backup = read_gpt(r, backup_start, block_size)?;

        let mut errors = Vec::new();
        if let Err(err) = equal_header(&primary.header, &backup.header) {
            errors.push(err);
        }
        if let Err(err) = equal_parts(&primary, &backup) {
            errors.push(err);
        }
        match errors.len() {
            0 => Ok(Self {
                mbr,
                primary,
                backup,
            }),
            1 => Err(errors.remove(0)),
            _ => Err(SysError::Multiple(errors)),
        }
    }

    /// Writes the MBR, the primary header and array, then the backup array
    /// and header. Both CRCs of each copy are recomputed on the way out.
    pub fn write<W: Write + Seek>(&self, w: &mut W, block_size: u64) -> Result<()> {
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&self.mbr)?;

        let mut primary = self.primary.clone();
        primary.update_crcs();
        let mut backup = self.backup.clone();
        backup.update_crcs();

        for (gpt, header_first) in [(&primary, true), (&backup, false)] {
            let header_at = gpt.header.current_lba * block_size;
            let array_at = gpt.header.part_start * block_size;
            let mut header_block = vec![0u8; block_size as usize];
            header_block[..HEADER_SIZE as usize].copy_from_slice(&gpt.header.to_bytes());
            let array = gpt.entries_bytes();

            let writes: [(u64, &[u8]); 2] = if header_first {
                [(header_at, header_block.as_slice()), (array_at, array.as_slice())]
            } else {
                [(array_at, array.as_slice()), (header_at, header_block.as_slice())]
            };
            for (offset, data) in writes {
                w.seek(SeekFrom::Start(offset))?;
                w.write_all(data)?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Builds a consistent table for a disk of `disk_lbas` blocks with the
    /// full 128-entry array, a protective MBR and matching backup.
    pub fn create(
        block_size: u64,
        disk_lbas: u64,
        disk_guid: Uuid,
        partitions: &[Partition],
    ) -> Result<Self> {
        if partitions.len() > MAX_NPART as usize {
            return Err(SysError::InvalidGpt(format!(
                "{} partitions requested, maximum is {MAX_NPART}",
                partitions.len()
            )));
        }
        let array_lbas = (MAX_NPART as u64 * ENTRY_SIZE as u64).div_ceil(block_size);
        let backup_lba = disk_lbas
            .checked_sub(1)
            .filter(|last| *last > 2 + 2 * array_lbas)
            .ok_or_else(|| SysError::InvalidGpt(format!("disk of {disk_lbas} blocks is too small")))?;
        let backup_array = backup_lba - array_lbas;

        let mut entries = vec![Partition::new(Uuid::nil(), Uuid::nil(), 0, 0); MAX_NPART as usize];
        entries[..partitions.len()].copy_from_slice(partitions);

        let header = GptHeader {
            signature: SIGNATURE,
            revision: REVISION,
            header_size: HEADER_SIZE,
            crc: 0,
            reserved: 0,
            current_lba: 1,
            backup_lba,
            first_lba: 2 + array_lbas,
            last_lba: backup_array - 1,
            disk_guid,
            part_start: 2,
            n_part: MAX_NPART,
            part_size: ENTRY_SIZE,
            part_crc: 0,
        };
        let mut primary = Gpt {
            header,
            partitions: entries.clone(),
        };
        primary.update_crcs();

        let mut backup = Gpt {
            header: GptHeader {
                current_lba: backup_lba,
                backup_lba: 1,
                part_start: backup_array,
                ..header
            },
            partitions: entries,
        };
        backup.update_crcs();

        Ok(Self {
            mbr: protective_mbr(disk_lbas),
            primary,
            backup,
        })
    }
}

fn protective_mbr(disk_lbas: u64) -> Vec<u8> {
    let mut mbr = vec![0u8; MBR_SIZE];
    let entry = &mut mbr[446..462];
    entry[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
    entry[4] = 0xee;
    entry[5..8].copy_from_slice(&[0xff, 0xff, 0xff]);
    entry[8..12].copy_from_slice(&1u32.to_le_bytes());
    let size = u32::try_from(disk_lbas - 1).unwrap_or(u32::MAX);
    entry[12..16].copy_from_slice(&size.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xaa;
    mbr
}
