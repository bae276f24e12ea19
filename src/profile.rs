//! Boot profile selection.
//!
//! The two harness flavours mount differently populated boot volumes: the
//! UEFI-style profile boots an EDK2-style application from the removable
//! media path, the U-Boot profile boots a script that loads the hypervisor
//! ELF. The profile is an explicit configuration choice, never inferred from
//! how the harness was invoked.

use anyhow::{bail, Result};

use crate::config::ArtifactPaths;
use crate::image::BootFileSet;

/// Destination names on the boot volume, fixed per profile.
pub const UEFI_APP_DEST: &str = "EFI/BOOT/BOOTAA64.EFI";
pub const HYPERVISOR_DEST: &str = "elf-hypervisor.elf";
pub const BOOT_SCRIPT_DEST: &str = "boot.scr";
pub const UBOOT_DEST: &str = "u-boot.bin";
pub const KERNEL_DEST: &str = "image";
pub const DTB_DEST: &str = "qemu.dtb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootProfile {
    /// Boot via `EFI/BOOT/BOOTAA64.EFI`.
    Uefi,
    /// Boot via U-Boot running `boot.scr` against `elf-hypervisor.elf`.
    UBoot,
}

impl BootProfile {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uefi" => Ok(Self::Uefi),
            "u-boot" | "uboot" => Ok(Self::UBoot),
            other => bail!("unknown boot profile '{}' (expected 'uefi' or 'u-boot')", other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uefi => "uefi",
            Self::UBoot => "u-boot",
        }
    }

    /// Derive the boot volume contents from the configured artifact paths.
    ///
    /// Profile-required artifacts missing from the configuration are
    /// reported by name; optional extras (`image`, `qemu.dtb`) are placed
    /// whenever configured.
    pub fn file_set(self, artifacts: &ArtifactPaths) -> Result<BootFileSet> {
        let mut set = BootFileSet::new();
        match self {
            Self::Uefi => {
                let Some(efi) = &artifacts.bootloader_efi else {
                    bail!("profile 'uefi' requires artifacts.bootloader_efi ({})", UEFI_APP_DEST);
                };
                set.insert(UEFI_APP_DEST, efi);
            }
            Self::UBoot => {
                let Some(script) = &artifacts.boot_script else {
                    bail!("profile 'u-boot' requires artifacts.boot_script ({})", BOOT_SCRIPT_DEST);
                };
                let Some(uboot) = &artifacts.uboot else {
                    bail!("profile 'u-boot' requires artifacts.uboot ({})", UBOOT_DEST);
                };
                set.insert(HYPERVISOR_DEST, &artifacts.hypervisor);
                set.insert(BOOT_SCRIPT_DEST, script);
                set.insert(UBOOT_DEST, uboot);
            }
        }
        if let Some(kernel) = &artifacts.kernel_image {
            set.insert(KERNEL_DEST, kernel);
        }
        if let Some(dtb) = &artifacts.dtb {
            set.insert(DTB_DEST, dtb);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn artifacts() -> ArtifactPaths {
        ArtifactPaths {
            hypervisor: PathBuf::from("bin/elf-hypervisor.elf"),
            bootloader_efi: Some(PathBuf::from("bin/BOOTAA64.EFI")),
            boot_script: Some(PathBuf::from("bin/boot.scr")),
            uboot: Some(PathBuf::from("bin/u-boot.bin")),
            kernel_image: Some(PathBuf::from("bin/image")),
            dtb: Some(PathBuf::from("bin/qemu.dtb")),
            bootargs: None,
        }
    }

    #[test]
    fn parse_accepts_both_spellings() {
        assert_eq!(BootProfile::parse("uefi").unwrap(), BootProfile::Uefi);
        assert_eq!(BootProfile::parse("U-Boot").unwrap(), BootProfile::UBoot);
        assert!(BootProfile::parse("grub").is_err());
    }

    #[test]
    fn uefi_file_set_carries_the_removable_media_path() {
        let set = BootProfile::Uefi.file_set(&artifacts()).unwrap();
        let dests: Vec<&str> = set.iter().map(|(d, _)| d).collect();
        assert!(dests.contains(&UEFI_APP_DEST));
        assert!(dests.contains(&KERNEL_DEST));
        assert!(dests.contains(&DTB_DEST));
        assert!(!dests.contains(&BOOT_SCRIPT_DEST));
    }

    #[test]
    fn uboot_file_set_carries_script_and_elf() {
        let set = BootProfile::UBoot.file_set(&artifacts()).unwrap();
        let dests: Vec<&str> = set.iter().map(|(d, _)| d).collect();
        assert!(dests.contains(&HYPERVISOR_DEST));
        assert!(dests.contains(&BOOT_SCRIPT_DEST));
        assert!(dests.contains(&UBOOT_DEST));
        assert!(!dests.contains(&UEFI_APP_DEST));
    }

    #[test]
    fn missing_required_artifact_is_named() {
        let mut a = artifacts();
        a.bootloader_efi = None;
        let err = BootProfile::Uefi.file_set(&a).unwrap_err();
        assert!(err.to_string().contains("bootloader_efi"));
    }
}
