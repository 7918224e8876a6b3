// SPDX-License-Identifier: GPL-3.0-only

//! Just enough of each filesystem's first blocks for the catalog to sniff it

use uuid::Uuid;

/// Length of every builder's output.
pub const HEAD_LEN: usize = 4096;

const ESXI_UUID_MAGIC: &[u8; 16] = b"VMWARE FAT16    ";

fn blank() -> Vec<u8> {
    vec![0u8; HEAD_LEN]
}

/// FAT32 boot sector with volume serial `serial`, shown as `XXXX-XXXX`.
pub fn fat32(serial: u32) -> Vec<u8> {
    let mut buf = blank();
    buf[0x52..0x5a].copy_from_slice(b"FAT32   ");
    buf[0x43..0x47].copy_from_slice(&serial.to_le_bytes());
    buf
}

/// FAT16 boot sector with volume serial `serial`.
pub fn fat16(serial: u32) -> Vec<u8> {
    let mut buf = blank();
    buf[0x36..0x3e].copy_from_slice(b"FAT16   ");
    buf[0x27..0x2b].copy_from_slice(&serial.to_le_bytes());
    buf
}

/// ext2/3/4 superblock carrying `uuid`.
pub fn ext4(uuid: Uuid) -> Vec<u8> {
    let mut buf = blank();
    buf[0x438..0x43a].copy_from_slice(&0xEF53u16.to_le_bytes());
    buf[0x468..0x478].copy_from_slice(uuid.as_bytes());
    buf
}

/// XFS superblock carrying `uuid`.
pub fn xfs(uuid: Uuid) -> Vec<u8> {
    let mut buf = blank();
    buf[0..4].copy_from_slice(b"XFSB");
    buf[32..48].copy_from_slice(uuid.as_bytes());
    buf
}

/// An ESXi boot bank: FAT16 plus the boot UUID record in the second block.
pub fn esxi_bank(serial: u32, boot_uuid: [u8; 16], block_size: usize) -> Vec<u8> {
    let mut buf = fat16(serial);
    if buf.len() < block_size + 32 {
        buf.resize(block_size + 32, 0);
    }
    buf[block_size..block_size + 16].copy_from_slice(ESXI_UUID_MAGIC);
    buf[block_size + 16..block_size + 32].copy_from_slice(&boot_uuid);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_sys::block::sniff;
    use boot_types::FsType;

    #[test]
    fn builders_are_recognized() {
        assert_eq!(
            sniff(&fat32(0x1122_3344)),
            Some((FsType::Vfat, "1122-3344".to_string()))
        );
        assert_eq!(sniff(&fat16(0xdead_beef)).map(|(fs, _)| fs), Some(FsType::Vfat));

        let uuid = Uuid::from_u128(0x3f1a228b_510c_4d2e_9a01_deadbeef0042);
        assert_eq!(sniff(&ext4(uuid)), Some((FsType::Ext4, uuid.to_string())));
        assert_eq!(sniff(&xfs(uuid)), Some((FsType::Xfs, uuid.to_string())));
    }

    #[test]
    fn esxi_bank_is_still_fat() {
        let bank = esxi_bank(1, [0xab; 16], 512);
        assert_eq!(sniff(&bank).map(|(fs, _)| fs), Some(FsType::Vfat));
        assert_eq!(&bank[512..528], ESXI_UUID_MAGIC);
    }
}
