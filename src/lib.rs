//! Test harness for booting a bare-metal aarch64 hypervisor under QEMU.
//!
//! The harness turns a set of prebuilt boot artifacts into a runnable guest:
//!
//! - **Image assembly** - MBR partitioning, FAT32 boot volume population,
//!   raw rootfs placement
//! - **Device-tree patching** - injecting `bootargs` into the `chosen` node
//!   of the blob QEMU hands the guest
//! - **Emulation** - launching the aarch64 `virt` machine and mapping guest
//!   exit codes to a pass/fail verdict
//!
//! The pipeline is deterministic end to end: rebuilding from unchanged
//! inputs produces a byte-identical image, which the build manifest's
//! digest makes cheap to verify.

pub mod config;
pub mod dtb;
pub mod error;
pub mod image;
pub mod manifest;
pub mod preflight;
pub mod profile;
pub mod qemu;

pub use config::{load_config, ArtifactPaths, HarnessConfig, DEFAULT_IMAGE_BYTES};
pub use dtb::{patch_bootargs, DeviceTree};
pub use error::HarnessError;
pub use image::{assemble_image, BootFileSet, DiskLayout, Partition, PartitionKind};
pub use profile::BootProfile;
pub use qemu::{EmulationRequest, MachineProfile, Outcome};
