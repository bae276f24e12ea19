//! Classic MBR encoder.
//!
//! Sector-0 structures are constructed directly from a typed [`DiskLayout`]
//! rather than by driving an interactive partitioning tool. Entries use LBA
//! addressing with the CHS fields stuffed to the conventional end-of-range
//! markers.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::error::HarnessError;
use crate::image::layout::DiskLayout;

/// Size of the master boot record.
pub const MBR_SIZE: usize = 512;

/// Byte offset of the four partition entries.
const PARTITION_TABLE_OFFSET: usize = 446;

/// Byte offset of the 32-bit disk signature.
const DISK_SIGNATURE_OFFSET: usize = 440;

/// Fixed disk signature so rebuilding the same image is byte-identical.
const DISK_SIGNATURE: u32 = 0x1bad_b002;

/// Active (bootable) flag in an entry's status byte.
const BOOTABLE_FLAG: u8 = 0x80;

/// CHS placeholder used when only LBA fields are meaningful.
const CHS_LBA_MARKER: [u8; 3] = [0xFE, 0xFF, 0xFF];

/// Encode the layout as a 512-byte master boot record.
pub fn encode_mbr(layout: &DiskLayout) -> Result<[u8; MBR_SIZE], HarnessError> {
    let partitions = layout.partitions();
    if partitions.len() > 4 {
        return Err(HarnessError::InvalidLayout(format!(
            "{} partitions, MBR holds at most 4",
            partitions.len()
        )));
    }

    let mut sector = [0u8; MBR_SIZE];
    sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
        .copy_from_slice(&DISK_SIGNATURE.to_le_bytes());

    for (i, part) in partitions.iter().enumerate() {
        let entry = &mut sector[PARTITION_TABLE_OFFSET + i * 16..PARTITION_TABLE_OFFSET + (i + 1) * 16];
        entry[0] = if part.bootable { BOOTABLE_FLAG } else { 0x00 };
        entry[1..4].copy_from_slice(&CHS_LBA_MARKER);
        entry[4] = part.kind.mbr_type_byte();
        entry[5..8].copy_from_slice(&CHS_LBA_MARKER);
        // Layout validation guarantees these fit 32 bits.
        entry[8..12].copy_from_slice(&(part.start_lba as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&(part.sectors as u32).to_le_bytes());
    }

    sector[510] = 0x55;
    sector[511] = 0xAA;
    Ok(sector)
}

/// Write the partition table at sector 0 of the backing image.
pub fn write_mbr(file: &mut File, layout: &DiskLayout) -> Result<(), HarnessError> {
    let sector = encode_mbr(layout)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&sector)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::layout::PartitionKind;

    #[test]
    fn encodes_signature_and_entries() {
        let layout = DiskLayout::fat32_with_rootfs(256 * 1024 * 1024, 64 * 1024 * 1024).unwrap();
        let sector = encode_mbr(&layout).unwrap();

        assert_eq!(sector[510], 0x55);
        assert_eq!(sector[511], 0xAA);

        // Entry 0: bootable FAT32-LBA at sector 2048.
        let e0 = &sector[446..462];
        assert_eq!(e0[0], 0x80);
        assert_eq!(e0[4], PartitionKind::Fat32Lba.mbr_type_byte());
        assert_eq!(u32::from_le_bytes(e0[8..12].try_into().unwrap()), 2048);
        assert_eq!(
            u64::from(u32::from_le_bytes(e0[12..16].try_into().unwrap())),
            layout.boot().sectors
        );

        // Entry 1: Linux-native, not bootable, adjacent to the first.
        let e1 = &sector[462..478];
        assert_eq!(e1[0], 0x00);
        assert_eq!(e1[4], 0x83);
        assert_eq!(
            u64::from(u32::from_le_bytes(e1[8..12].try_into().unwrap())),
            layout.boot().end_lba()
        );

        // Entries 2 and 3 stay zeroed.
        assert!(sector[478..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn single_layout_leaves_three_empty_entries() {
        let layout = DiskLayout::single_fat32(64 * 1024 * 1024).unwrap();
        let sector = encode_mbr(&layout).unwrap();
        assert_eq!(sector[446], 0x80);
        assert!(sector[462..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn encoding_is_deterministic() {
        let layout = DiskLayout::single_fat32(64 * 1024 * 1024).unwrap();
        assert_eq!(
            encode_mbr(&layout).unwrap(),
            encode_mbr(&layout).unwrap()
        );
    }
}
