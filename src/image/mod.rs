//! Bootable disk image assembly.
//!
//! Orchestrates the partition planner, MBR encoder, FAT32 volume builder and
//! raw partition writer against a single backing image file. Steps run
//! strictly in order (table before volume contents); the first failure aborts
//! the build and the image must be treated as invalid. The recovery path is
//! "discard and rebuild from scratch".

pub mod fat;
pub mod layout;
pub mod mbr;
pub mod raw;
pub mod span;

pub use fat::BootFileSet;
pub use layout::{DiskLayout, Partition, PartitionKind};

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::HarnessError;

/// Assemble a bootable image at `path`.
///
/// The backing file is created and sized if absent; an existing file at the
/// same path is reused with its contents overwritten in place, so rebuilding
/// with identical inputs yields a byte-identical image. `rootfs` must be
/// given exactly when the layout has a second partition.
pub fn assemble_image(
    path: &Path,
    size_bytes: u64,
    layout: &DiskLayout,
    boot_files: &BootFileSet,
    rootfs: Option<&Path>,
) -> Result<(), HarnessError> {
    match (layout.rootfs(), rootfs) {
        (Some(_), None) => {
            return Err(HarnessError::InvalidLayout(
                "two-partition layout but no rootfs payload given".into(),
            ))
        }
        (None, Some(_)) => {
            return Err(HarnessError::InvalidLayout(
                "rootfs payload given but the layout has no second partition".into(),
            ))
        }
        _ => {}
    }

    println!("=== Assembling boot image ===");
    println!("  Image: {} ({} bytes)", path.display(), size_bytes);
    for p in layout.partitions() {
        println!(
            "  Partition: LBA {} +{} sectors, {}{}",
            p.start_lba,
            p.sectors,
            p.kind.as_str(),
            if p.bootable { ", bootable" } else { "" }
        );
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(size_bytes)?;

    println!("  Writing partition table...");
    mbr::write_mbr(&mut file, layout)?;

    println!(
        "  Writing FAT boot volume ({} files)...",
        boot_files.len()
    );
    fat::build_boot_volume(&mut file, layout.boot(), boot_files)?;

    if let (Some(part), Some(payload)) = (layout.rootfs(), rootfs) {
        println!("  Writing rootfs payload {}...", payload.display());
        raw::write_raw_partition(&mut file, part, payload)?;
    }

    file.sync_all()?;
    println!("=== Boot image ready ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatfs::{FileSystem, FsOptions};
    use sha2::{Digest, Sha256};
    use std::fs;

    fn sample_boot_files(dir: &Path) -> BootFileSet {
        fs::write(dir.join("hypervisor.elf"), vec![0x7F; 8192]).unwrap();
        fs::write(dir.join("boot.scr"), b"bootefi").unwrap();
        let mut set = BootFileSet::new();
        set.insert("elf-hypervisor.elf", dir.join("hypervisor.elf"));
        set.insert("boot.scr", dir.join("boot.scr"));
        set
    }

    fn sha256_of(path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fs::read(path).unwrap());
        format!("{:x}", hasher.finalize())
    }

    #[test]
    fn single_partition_image_has_table_and_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_boot_files(tmp.path());
        let image = tmp.path().join("boot.img");

        let size = 64 * 1024 * 1024u64;
        let layout = DiskLayout::single_fat32(size).unwrap();
        assemble_image(&image, size, &layout, &set, None).unwrap();

        let raw = fs::read(&image).unwrap();
        assert_eq!(raw.len() as u64, size);
        assert_eq!(&raw[510..512], &[0x55, 0xAA]);
        assert_eq!(raw[446], 0x80);
        assert_eq!(raw[450], 0x0C);

        let mut file = OpenOptions::new().read(true).write(true).open(&image).unwrap();
        let view = span::SpanView::new(&mut file, layout.boot());
        let fs_ = FileSystem::new(view, FsOptions::new()).unwrap();
        let names: Vec<String> = fs_
            .root_dir()
            .iter()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"elf-hypervisor.elf".to_string()));
        assert!(names.contains(&"boot.scr".to_string()));
    }

    #[test]
    fn rebuild_with_same_inputs_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_boot_files(tmp.path());
        let image = tmp.path().join("boot.img");

        let size = 48 * 1024 * 1024u64;
        let layout = DiskLayout::single_fat32(size).unwrap();
        assemble_image(&image, size, &layout, &set, None).unwrap();
        let first = sha256_of(&image);
        assemble_image(&image, size, &layout, &set, None).unwrap();
        assert_eq!(first, sha256_of(&image));
    }

    #[test]
    fn two_partition_image_carries_the_rootfs_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_boot_files(tmp.path());
        let image = tmp.path().join("boot.img");
        let payload = tmp.path().join("rootfs.img");
        fs::write(&payload, vec![0x5Au8; 4096]).unwrap();

        let size = 192 * 1024 * 1024u64;
        let layout = DiskLayout::fat32_with_rootfs(size, 64 * 1024 * 1024).unwrap();
        assemble_image(&image, size, &layout, &set, Some(&payload)).unwrap();

        let raw = fs::read(&image).unwrap();
        let off = layout.rootfs().unwrap().byte_offset() as usize;
        assert_eq!(&raw[off..off + 4096], vec![0x5Au8; 4096].as_slice());
        // MBR entry 1 carries the Linux-native tag.
        assert_eq!(raw[466], 0x83);
    }

    #[test]
    fn layout_and_payload_must_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_boot_files(tmp.path());
        let image = tmp.path().join("boot.img");

        let size = 64 * 1024 * 1024u64;
        let layout = DiskLayout::fat32_with_rootfs(size, 32 * 1024 * 1024).unwrap();
        let err = assemble_image(&image, size, &layout, &set, None).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidLayout(_)));
    }
}
