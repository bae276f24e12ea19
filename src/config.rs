//! Harness configuration: one TOML file describing the boot profile, image
//! geometry, machine shape and artifact locations.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::image::{layout::DiskLayout, BootFileSet};
use crate::profile::BootProfile;
use crate::qemu::MachineProfile;

/// Default image size: 2048000 KiB, roughly 2 GiB.
pub const DEFAULT_IMAGE_BYTES: u64 = 2048000 * 1024;

/// Paths to the prebuilt artifacts placed on the boot volume or handed to
/// the emulator. All are consumed as opaque files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactPaths {
    /// The hypervisor binary loaded by the emulator.
    pub hypervisor: PathBuf,
    /// EDK2-style boot application (uefi profile).
    pub bootloader_efi: Option<PathBuf>,
    /// Compiled U-Boot boot script (u-boot profile).
    pub boot_script: Option<PathBuf>,
    /// U-Boot binary (u-boot profile).
    pub uboot: Option<PathBuf>,
    /// Kernel payload placed on the volume as `image`.
    pub kernel_image: Option<PathBuf>,
    /// Device-tree blob; when absent the harness dumps one from the emulator.
    pub dtb: Option<PathBuf>,
    /// Boot arguments to inject into the `chosen` node before a test run.
    pub bootargs: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HarnessToml {
    harness: HarnessSection,
    image: ImageSection,
    machine: Option<MachineProfile>,
    artifacts: ArtifactPaths,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HarnessSection {
    profile: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageSection {
    path: PathBuf,
    size_bytes: Option<u64>,
    /// Boot partition size for the two-partition layout. Must be paired
    /// with `rootfs`.
    boot_partition_bytes: Option<u64>,
    /// Raw rootfs payload streamed into the second partition.
    rootfs: Option<PathBuf>,
}

/// Validated harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub profile: BootProfile,
    pub image_path: PathBuf,
    pub image_size_bytes: u64,
    pub boot_partition_bytes: Option<u64>,
    pub rootfs: Option<PathBuf>,
    pub machine: MachineProfile,
    pub artifacts: ArtifactPaths,
}

impl HarnessConfig {
    /// Plan the partition table this configuration asks for.
    pub fn plan_layout(&self) -> Result<DiskLayout> {
        let layout = match (self.boot_partition_bytes, &self.rootfs) {
            (Some(boot_bytes), Some(_)) => {
                DiskLayout::fat32_with_rootfs(self.image_size_bytes, boot_bytes)?
            }
            (None, None) => DiskLayout::single_fat32(self.image_size_bytes)?,
            (Some(_), None) => {
                bail!("image.boot_partition_bytes is set but image.rootfs is not")
            }
            (None, Some(_)) => {
                bail!("image.rootfs is set but image.boot_partition_bytes is not")
            }
        };
        Ok(layout)
    }

    /// Derive the boot volume contents for the configured profile.
    pub fn boot_file_set(&self) -> Result<BootFileSet> {
        self.profile.file_set(&self.artifacts)
    }
}

/// Load and validate a harness configuration file.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading harness config '{}'", path.display()))?;
    let parsed: HarnessToml = toml::from_str(&text)
        .with_context(|| format!("parsing harness config '{}'", path.display()))?;

    let profile = BootProfile::parse(&parsed.harness.profile)
        .with_context(|| format!("in harness config '{}'", path.display()))?;

    let config = HarnessConfig {
        profile,
        image_path: parsed.image.path,
        image_size_bytes: parsed.image.size_bytes.unwrap_or(DEFAULT_IMAGE_BYTES),
        boot_partition_bytes: parsed.image.boot_partition_bytes,
        rootfs: parsed.image.rootfs,
        machine: parsed.machine.unwrap_or_default(),
        artifacts: parsed.artifacts,
    };

    // Fail pairing mistakes at load time, not mid-build.
    config.plan_layout()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
        [harness]
        profile = "u-boot"

        [image]
        path = "out/boot.img"

        [artifacts]
        hypervisor = "bin/elf-hypervisor.elf"
        boot_script = "bin/boot.scr"
        uboot = "bin/u-boot.bin"
    "#;

    #[test]
    fn minimal_config_gets_script_defaults() {
        let file = write_config(MINIMAL);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.profile, BootProfile::UBoot);
        assert_eq!(config.image_size_bytes, 2048000 * 1024);
        assert_eq!(config.machine.cpu, "max");
        let layout = config.plan_layout().unwrap();
        assert_eq!(layout.partitions().len(), 1);
        assert_eq!(layout.boot().sectors, config.image_size_bytes / 512 - 2048);
    }

    #[test]
    fn two_partition_config_plans_both_spans() {
        let file = write_config(
            r#"
            [harness]
            profile = "uefi"

            [image]
            path = "out/boot.img"
            size_bytes = 268435456
            boot_partition_bytes = 134217728
            rootfs = "out/rootfs.img"

            [machine]
            cpu = "cortex-a72"
            cores = 2
            memory_mb = 2048

            [artifacts]
            hypervisor = "bin/elf-hypervisor.elf"
            bootloader_efi = "bin/BOOTAA64.EFI"
            bootargs = "console=ttyAMA0"
        "#,
        );
        let config = load_config(file.path()).unwrap();
        let layout = config.plan_layout().unwrap();
        assert!(layout.rootfs().is_some());
        assert_eq!(config.machine.cores, 2);
        assert_eq!(config.artifacts.bootargs.as_deref(), Some("console=ttyAMA0"));
    }

    #[test]
    fn rootfs_without_boot_size_is_rejected() {
        let file = write_config(
            r#"
            [harness]
            profile = "u-boot"

            [image]
            path = "out/boot.img"
            rootfs = "out/rootfs.img"

            [artifacts]
            hypervisor = "bin/elf-hypervisor.elf"
            boot_script = "bin/boot.scr"
            uboot = "bin/u-boot.bin"
        "#,
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(&format!("{}\nunexpected = 1\n", MINIMAL));
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let file = write_config(&MINIMAL.replace("u-boot", "grub"));
        assert!(load_config(file.path()).is_err());
    }
}
