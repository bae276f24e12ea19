//! FAT32 boot volume builder.
//!
//! Formats one partition span of the backing image and populates its root
//! directory with the boot artifacts. All filesystem structures (boot sector,
//! FS info, FATs, directory and cluster chains, 8.3 + long-name entries) come
//! from `fatfs`; the type is pinned to FAT32 to match the partition's MBR
//! tag, and the [`SpanView`] guarantees no byte outside the span is touched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use walkdir::WalkDir;

use crate::error::HarnessError;
use crate::image::layout::Partition;
use crate::image::span::SpanView;

/// Fixed volume id so rebuilding the same image is byte-identical.
const VOLUME_ID: u32 = 0x0b007_a64;

/// 11-byte space-padded volume label.
const VOLUME_LABEL: [u8; 11] = *b"BOOT       ";

/// Smallest span that FAT32 can be formatted onto: the type needs 65525+
/// data clusters, which at the 512-byte cluster size used for small volumes
/// puts the floor just under 36 MiB once reserved sectors and FATs are in.
const MIN_VOLUME_BYTES: u64 = 36 * 1024 * 1024;

/// Allowance for boot sector, FATs, directory entries and cluster slack.
/// FAT overhead depends on cluster size and file count; this bound is
/// generous enough for the fixed boot file sets this harness writes.
const FS_OVERHEAD_BYTES: u64 = 8 * 1024 * 1024;

/// The files to place on the boot volume: destination root-relative path
/// (forward slashes, e.g. `EFI/BOOT/BOOTAA64.EFI`) mapped to a source file.
/// Created fresh per image build; never mutated after the volume is written.
#[derive(Debug, Clone, Default)]
pub struct BootFileSet {
    entries: BTreeMap<String, PathBuf>,
}

impl BootFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dest: impl Into<String>, source: impl Into<PathBuf>) {
        self.entries.insert(dest.into(), source.into());
    }

    /// Collect every regular file under a staging directory, keyed by its
    /// path relative to the staging root.
    pub fn from_dir(staging: &Path) -> Result<Self, HarnessError> {
        let mut set = Self::new();
        for entry in WalkDir::new(staging) {
            let entry = entry.map_err(|e| HarnessError::SourceReadError {
                path: staging.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(staging) else {
                continue;
            };
            let dest = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            set.insert(dest, entry.path());
        }
        Ok(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(d, s)| (d.as_str(), s.as_path()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all source file sizes.
    pub fn total_source_bytes(&self) -> Result<u64, HarnessError> {
        let mut total = 0;
        for (_, source) in self.iter() {
            let meta = fs::metadata(source).map_err(|e| HarnessError::SourceReadError {
                path: source.to_path_buf(),
                source: e,
            })?;
            total += meta.len();
        }
        Ok(total)
    }
}

/// Format the partition span as FAT and write the boot file set into it.
///
/// On failure the span may hold a partially written volume; callers treat the
/// whole image build as failed and rebuild from scratch.
pub fn build_boot_volume(
    file: &mut File,
    partition: &Partition,
    files: &BootFileSet,
) -> Result<(), HarnessError> {
    let span_bytes = partition.byte_len();
    if span_bytes < MIN_VOLUME_BYTES {
        return Err(HarnessError::SpanTooSmall {
            span_bytes,
            detail: format!("minimum viable boot volume is {} bytes", MIN_VOLUME_BYTES),
        });
    }
    let payload = files.total_source_bytes()?;
    let needed = payload + FS_OVERHEAD_BYTES;
    if needed > span_bytes {
        return Err(HarnessError::SpanTooSmall {
            span_bytes,
            detail: format!(
                "{} bytes of boot files plus {} bytes of filesystem overhead need {}",
                payload, FS_OVERHEAD_BYTES, needed
            ),
        });
    }

    let mut view = SpanView::new(file, partition);
    fatfs::format_volume(
        &mut view,
        FormatVolumeOptions::new()
            .fat_type(FatType::Fat32)
            .volume_id(VOLUME_ID)
            .volume_label(VOLUME_LABEL),
    )?;

    let fs = FileSystem::new(view, FsOptions::new())?;
    for (dest, source) in files.iter() {
        let bytes = fs::read(source).map_err(|e| HarnessError::SourceReadError {
            path: source.to_path_buf(),
            source: e,
        })?;

        let mut dir = fs.root_dir();
        let mut components = dest.split('/').peekable();
        let mut name = "";
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                name = component;
                break;
            }
            dir = dir.create_dir(component)?;
        }
        let mut out = dir.create_file(name)?;
        out.truncate()?;
        out.write_all(&bytes)?;
    }
    fs.unmount()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::layout::PartitionKind;
    use std::io::Read;

    fn partition(start_lba: u64, sectors: u64) -> Partition {
        Partition {
            start_lba,
            sectors,
            kind: PartitionKind::Fat32Lba,
            bootable: true,
        }
    }

    fn backing_image(sectors: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(sectors * 512).unwrap();
        file
    }

    fn sample_files(dir: &Path) -> BootFileSet {
        fs::write(dir.join("payload.bin"), vec![0xA5u8; 4096]).unwrap();
        fs::write(dir.join("boot.scr"), b"bootcmd=run test").unwrap();
        let mut set = BootFileSet::new();
        set.insert("EFI/BOOT/BOOTAA64.EFI", dir.join("payload.bin"));
        set.insert("boot.scr", dir.join("boot.scr"));
        set
    }

    #[test]
    fn written_files_read_back_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_files(tmp.path());

        // 64 MiB partition at LBA 2048.
        let mut file = backing_image(2048 + 131072);
        let part = partition(2048, 131072);
        build_boot_volume(&mut file, &part, &set).unwrap();

        let view = SpanView::new(&mut file, &part);
        let fs = FileSystem::new(view, FsOptions::new()).unwrap();
        let root = fs.root_dir();

        let mut efi = Vec::new();
        root.open_file("EFI/BOOT/BOOTAA64.EFI")
            .unwrap()
            .read_to_end(&mut efi)
            .unwrap();
        assert_eq!(efi, vec![0xA5u8; 4096]);

        let mut scr = Vec::new();
        root.open_file("boot.scr")
            .unwrap()
            .read_to_end(&mut scr)
            .unwrap();
        assert_eq!(scr, b"bootcmd=run test");

        // Root directory lists exactly the configured entries.
        let names: Vec<String> = root
            .iter()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"EFI".to_string()));
        assert!(names.contains(&"boot.scr".to_string()));
    }

    #[test]
    fn bytes_outside_the_span_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_files(tmp.path());

        let mut file = backing_image(2048 + 131072 + 64);
        // Paint the tail after the partition.
        use std::io::{Seek, SeekFrom, Write};
        file.seek(SeekFrom::Start((2048 + 131072) * 512)).unwrap();
        file.write_all(&vec![0xEEu8; 64 * 512]).unwrap();

        let part = partition(2048, 131072);
        build_boot_volume(&mut file, &part, &set).unwrap();

        file.seek(SeekFrom::Start((2048 + 131072) * 512)).unwrap();
        let mut tail = vec![0u8; 64 * 512];
        file.read_exact(&mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn undersized_span_is_rejected_before_any_write() {
        let tmp = tempfile::tempdir().unwrap();
        let set = sample_files(tmp.path());

        let mut file = backing_image(4096);
        let part = partition(2048, 1024); // 512 KiB
        let err = build_boot_volume(&mut file, &part, &set).unwrap_err();
        assert!(matches!(err, HarnessError::SpanTooSmall { .. }));
    }

    #[test]
    fn missing_source_is_a_source_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = BootFileSet::new();
        set.insert("image", tmp.path().join("no-such-file"));

        let mut file = backing_image(2048 + 131072);
        let part = partition(2048, 131072);
        let err = build_boot_volume(&mut file, &part, &set).unwrap_err();
        match err {
            HarnessError::SourceReadError { path, .. } => {
                assert!(path.ends_with("no-such-file"));
            }
            other => panic!("expected SourceReadError, got {other:?}"),
        }
    }

    #[test]
    fn from_dir_collects_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("EFI/BOOT")).unwrap();
        fs::write(tmp.path().join("EFI/BOOT/BOOTAA64.EFI"), b"efi").unwrap();
        fs::write(tmp.path().join("image"), b"kernel").unwrap();

        let set = BootFileSet::from_dir(tmp.path()).unwrap();
        assert_eq!(set.len(), 2);
        let dests: Vec<&str> = set.iter().map(|(d, _)| d).collect();
        assert!(dests.contains(&"EFI/BOOT/BOOTAA64.EFI"));
        assert!(dests.contains(&"image"));
    }
}
