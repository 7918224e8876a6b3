// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use boot_sys::gpt::{DEFAULT_BLOCK_SIZE, Partition, PartitionTable};
use uuid::Uuid;

use crate::errors::{Result, TestingError};

/// Builds a GPT disk image in memory.
#[derive(Debug, Clone)]
pub struct GptDisk {
    block_size: u64,
    lbas: u64,
    disk_guid: Uuid,
    partitions: Vec<Partition>,
}

impl GptDisk {
    pub fn new(lbas: u64) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            lbas,
            disk_guid: Uuid::from_u128(0x5eed),
            partitions: Vec::new(),
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn disk_guid(mut self, guid: Uuid) -> Self {
        self.disk_guid = guid;
        self
    }

    /// Appends a partition spanning `first..=last`.
    pub fn partition(mut self, part_type: Uuid, unique: Uuid, first: u64, last: u64, name: &str) -> Self {
        self.partitions
            .push(Partition::new(part_type, unique, first, last).with_name(name));
        self
    }

    pub fn table(&self) -> Result<PartitionTable> {
        Ok(PartitionTable::create(
            self.block_size,
            self.lbas,
            self.disk_guid,
            &self.partitions,
        )?)
    }

    /// The whole disk: protective MBR, both GPT copies, zeroed data area.
    pub fn build(&self) -> Result<Vec<u8>> {
        let len = self
            .lbas
            .checked_mul(self.block_size)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| TestingError::InvalidFixture(format!("{} blocks is too large", self.lbas)))?;
        let mut disk = Cursor::new(vec![0u8; len]);
        self.table()?.write(&mut disk, self.block_size)?;
        Ok(disk.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_sys::gpt::{EFI_SYSTEM_PARTITION, equal_header, equal_parts};

    #[test]
    fn built_disk_reads_back_consistently() {
        let disk = GptDisk::new(2048)
            .partition(EFI_SYSTEM_PARTITION, Uuid::from_u128(1), 40, 1000, "EFI System")
            .build()
            .expect("build");
        let table = PartitionTable::read(&mut Cursor::new(disk), 512).expect("read");

        equal_header(&table.primary.header, &table.backup.header).expect("headers agree");
        equal_parts(&table.primary, &table.backup).expect("arrays agree");
        assert_eq!(table.primary.partitions[0].name(), "EFI System");
        assert!(table.primary.partitions[1].is_empty());
    }

    #[test]
    fn too_small_disk_is_rejected() {
        assert!(GptDisk::new(16).build().is_err());
    }
}
