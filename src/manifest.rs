//! Build manifest: a JSON report written next to the assembled image.
//!
//! Records the image digest and the partition table so a rebuilt image can
//! be checked for byte-identity without keeping the previous copy around.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::image::layout::DiskLayout;

const MANIFEST_SUFFIX: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub image: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at_utc: String,
    pub partitions: Vec<PartitionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub start_lba: u64,
    pub sectors: u64,
    pub kind: String,
    pub bootable: bool,
}

/// Streamed sha-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("hashing '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn manifest_path(image: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{}", image.display(), MANIFEST_SUFFIX))
}

/// Hash the image and write its manifest alongside it.
pub fn write_manifest(image: &Path, layout: &DiskLayout) -> Result<PathBuf> {
    let meta =
        fs::metadata(image).with_context(|| format!("inspecting image '{}'", image.display()))?;
    let manifest = BuildManifest {
        image: image.display().to_string(),
        size_bytes: meta.len(),
        sha256: sha256_file(image)?,
        created_at_utc: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("formatting manifest timestamp")?,
        partitions: layout
            .partitions()
            .iter()
            .map(|p| PartitionRecord {
                start_lba: p.start_lba,
                sectors: p.sectors,
                kind: p.kind.as_str().to_string(),
                bootable: p.bootable,
            })
            .collect(),
    };

    let path = manifest_path(image);
    let json = serde_json::to_string_pretty(&manifest).context("encoding build manifest")?;
    fs::write(&path, json)
        .with_context(|| format!("writing build manifest '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("boot.img");
        fs::write(&image, vec![0u8; 4096]).unwrap();

        let layout = DiskLayout::single_fat32(64 * 1024 * 1024).unwrap();
        let path = write_manifest(&image, &layout).unwrap();

        let parsed: BuildManifest =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.size_bytes, 4096);
        assert_eq!(parsed.partitions.len(), 1);
        assert_eq!(parsed.partitions[0].start_lba, 2048);
        assert_eq!(parsed.partitions[0].kind, "fat32-lba");
        assert!(parsed.partitions[0].bootable);
    }
}
