//! Partition planning for the bootable disk image.
//!
//! Two fixed layouts are supported: a single FAT32 boot partition, or a FAT32
//! boot partition followed by a raw rootfs partition consuming the remainder
//! of the image. The first partition always starts at LBA 2048 (1 MiB);
//! boot-ROM compatibility requires it, it is not merely convention.

use crate::error::HarnessError;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts here (1 MiB / 512).
pub const FIRST_PARTITION_LBA: u64 = 2048;

/// Minimum sectors a partition must span to be worth creating. A rootfs
/// partition smaller than this (1 MiB) is treated as no space left.
const MIN_PARTITION_SECTORS: u64 = 2048;

/// MBR partition type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// FAT32 with LBA addressing (MBR type 0x0C).
    Fat32Lba,
    /// Linux native (MBR type 0x83), used for the raw rootfs payload.
    LinuxNative,
}

impl PartitionKind {
    /// The type byte written into the MBR partition entry.
    pub fn mbr_type_byte(self) -> u8 {
        match self {
            PartitionKind::Fat32Lba => 0x0C,
            PartitionKind::LinuxNative => 0x83,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionKind::Fat32Lba => "fat32-lba",
            PartitionKind::LinuxNative => "linux",
        }
    }
}

/// One partition: a contiguous sector span plus its MBR attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start_lba: u64,
    pub sectors: u64,
    pub kind: PartitionKind,
    pub bootable: bool,
}

impl Partition {
    /// First byte of the partition within the backing image.
    pub fn byte_offset(&self) -> u64 {
        self.start_lba * SECTOR_SIZE
    }

    /// Length of the partition span in bytes.
    pub fn byte_len(&self) -> u64 {
        self.sectors * SECTOR_SIZE
    }

    /// One past the last sector.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors
    }
}

/// A validated, ordered partition table for one image.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    partitions: Vec<Partition>,
    total_sectors: u64,
}

impl DiskLayout {
    /// Validate and build a layout from explicit partitions.
    ///
    /// Enforces: sorted by start, non-overlapping, inside the image, first
    /// partition at [`FIRST_PARTITION_LBA`], at most one bootable partition,
    /// and all fields representable in 32-bit MBR entries.
    pub fn new(partitions: Vec<Partition>, total_sectors: u64) -> Result<Self, HarnessError> {
        if partitions.is_empty() {
            return Err(HarnessError::InvalidLayout("no partitions".into()));
        }
        if partitions[0].start_lba != FIRST_PARTITION_LBA {
            return Err(HarnessError::InvalidLayout(format!(
                "first partition starts at LBA {}, expected {}",
                partitions[0].start_lba, FIRST_PARTITION_LBA
            )));
        }
        let mut bootable = 0;
        let mut prev_end = 0u64;
        for p in &partitions {
            if p.sectors == 0 {
                return Err(HarnessError::InvalidLayout(format!(
                    "empty partition at LBA {}",
                    p.start_lba
                )));
            }
            if p.start_lba < prev_end {
                return Err(HarnessError::InvalidLayout(format!(
                    "partition at LBA {} overlaps the previous one ending at {}",
                    p.start_lba, prev_end
                )));
            }
            if p.end_lba() > total_sectors {
                return Err(HarnessError::InvalidLayout(format!(
                    "partition [{}, {}) runs past the image end at sector {}",
                    p.start_lba,
                    p.end_lba(),
                    total_sectors
                )));
            }
            if p.start_lba > u64::from(u32::MAX) || p.sectors > u64::from(u32::MAX) {
                return Err(HarnessError::InvalidLayout(format!(
                    "partition [{}, {}) does not fit a 32-bit MBR entry",
                    p.start_lba,
                    p.end_lba()
                )));
            }
            if p.bootable {
                bootable += 1;
            }
            prev_end = p.end_lba();
        }
        if bootable > 1 {
            return Err(HarnessError::InvalidLayout(format!(
                "{} partitions marked bootable, at most one allowed",
                bootable
            )));
        }
        Ok(Self {
            partitions,
            total_sectors,
        })
    }

    /// Plan a single bootable FAT32 partition spanning from the alignment
    /// boundary to the end of the image.
    pub fn single_fat32(image_size_bytes: u64) -> Result<Self, HarnessError> {
        let total_sectors = image_size_bytes / SECTOR_SIZE;
        let needed = (FIRST_PARTITION_LBA + MIN_PARTITION_SECTORS) * SECTOR_SIZE;
        if total_sectors <= FIRST_PARTITION_LBA + MIN_PARTITION_SECTORS {
            return Err(HarnessError::InsufficientSpace {
                needed,
                available: image_size_bytes,
            });
        }
        Self::new(
            vec![Partition {
                start_lba: FIRST_PARTITION_LBA,
                sectors: total_sectors - FIRST_PARTITION_LBA,
                kind: PartitionKind::Fat32Lba,
                bootable: true,
            }],
            total_sectors,
        )
    }

    /// Plan a FAT32 boot partition of the requested size plus a Linux-native
    /// partition consuming the remainder of the image.
    pub fn fat32_with_rootfs(
        image_size_bytes: u64,
        boot_bytes: u64,
    ) -> Result<Self, HarnessError> {
        let total_sectors = image_size_bytes / SECTOR_SIZE;
        let boot_sectors = boot_bytes.div_ceil(SECTOR_SIZE);
        let rootfs_start = FIRST_PARTITION_LBA + boot_sectors;
        if rootfs_start + MIN_PARTITION_SECTORS > total_sectors {
            return Err(HarnessError::InsufficientSpace {
                needed: (rootfs_start + MIN_PARTITION_SECTORS) * SECTOR_SIZE,
                available: image_size_bytes,
            });
        }
        Self::new(
            vec![
                Partition {
                    start_lba: FIRST_PARTITION_LBA,
                    sectors: boot_sectors,
                    kind: PartitionKind::Fat32Lba,
                    bootable: true,
                },
                Partition {
                    start_lba: rootfs_start,
                    sectors: total_sectors - rootfs_start,
                    kind: PartitionKind::LinuxNative,
                    bootable: false,
                },
            ],
            total_sectors,
        )
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// The boot partition (always the first).
    pub fn boot(&self) -> &Partition {
        &self.partitions[0]
    }

    /// The rootfs partition, when the two-partition layout was planned.
    pub fn rootfs(&self) -> Option<&Partition> {
        self.partitions.get(1)
    }
}
