//! QEMU launcher for the aarch64 virt machine.
//!
//! Reproduces the exact invocation the boot firmware and guest expect:
//! GICv3, virtualization extensions on, secure world off, modern virtio only
//! (legacy virtio-mmio disabled globally), block devices on successive
//! virtio-mmio slots, and no automatic reboot or shutdown on guest halt.
//! Also provides the `dumpdtb` snapshot step used to obtain the machine's
//! device tree for patching.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::HarnessError;

/// Marker echoed exactly once when the guest reports a test failure.
pub const FAILURE_MARKER: &str = "___GUEST_TEST_FAILED___";

const QEMU_BIN: &str = "qemu-system-aarch64";
const MACHINE_ARGS: &str = "virt,gic-version=3,secure=off,virtualization=on";

/// CPU/core/memory shape of the emulated machine. GIC version and the
/// virtualization/secure switches are fixed by the harness contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineProfile {
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// When set, QEMU opens a GDB stub on this TCP port.
    #[serde(default)]
    pub gdb_port: Option<u16>,
}

fn default_cpu() -> String {
    // "max" is the only host-independent model with EL2 on the virt machine.
    "max".to_string()
}

fn default_cores() -> u32 {
    4
}

fn default_memory_mb() -> u32 {
    4096
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            cores: default_cores(),
            memory_mb: default_memory_mb(),
            gdb_port: None,
        }
    }
}

/// One emulator run: the hypervisor binary, the assembled image(s) to attach
/// as virtio block devices, and an optional patched device tree.
/// Immutable once constructed and consumed by a single [`run`] call.
#[derive(Debug, Clone)]
pub struct EmulationRequest {
    pub hypervisor: PathBuf,
    pub images: Vec<PathBuf>,
    pub dtb: Option<PathBuf>,
    pub machine: MachineProfile,
}

impl EmulationRequest {
    /// Build the concrete process invocation.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(QEMU_BIN);
        cmd.args(["-machine", MACHINE_ARGS]);
        cmd.args(["-global", "virtio-mmio.force-legacy=off"]);
        cmd.args(["-cpu", &self.machine.cpu]);
        cmd.args(["-smp", &self.machine.cores.to_string()]);
        cmd.args(["-m", &format!("{}M", self.machine.memory_mb)]);
        cmd.args(["-nographic", "-no-reboot", "-no-shutdown"]);
        cmd.arg("-kernel").arg(&self.hypervisor);
        for (slot, image) in self.images.iter().enumerate() {
            cmd.args([
                "-drive",
                &format!("if=none,format=raw,id=hd{},file={}", slot, image.display()),
            ]);
            cmd.args(["-device", &format!("virtio-blk-device,drive=hd{}", slot)]);
        }
        if let Some(dtb) = &self.dtb {
            cmd.arg("-dtb").arg(dtb);
        }
        if let Some(port) = self.machine.gdb_port {
            cmd.args(["-gdb", &format!("tcp::{}", port)]);
        }
        cmd
    }
}

/// What the guest run reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit code 0: all guest-side tests passed.
    Passed,
    /// Exit code 1: the guest reported a test failure.
    TestFailure,
}

/// Run the request to completion and interpret the exit code.
///
/// No timeout is imposed here; callers wrap the invocation if bounded
/// execution is required. A failed or erroring run is reported exactly once,
/// never retried.
pub fn run(request: &EmulationRequest) -> Result<Outcome, HarnessError> {
    let mut cmd = request.to_command();
    println!("=== Launching emulator ===");
    println!("  {:?}", cmd);
    let status = cmd.status()?;
    let outcome = interpret_exit(status.code().unwrap_or(-1))?;
    report_outcome(outcome, &mut io::stdout())?;
    Ok(outcome)
}

/// Echo the failure marker, exactly once, when the guest reported a test
/// failure. A passing run writes nothing.
pub fn report_outcome(outcome: Outcome, sink: &mut impl Write) -> Result<(), HarnessError> {
    if outcome == Outcome::TestFailure {
        writeln!(sink, "{}", FAILURE_MARKER)?;
    }
    Ok(())
}

/// Exit-code contract: 0 passed, 1 guest test failure, anything else is a
/// harness/launch error carrying the raw code.
pub fn interpret_exit(code: i32) -> Result<Outcome, HarnessError> {
    match code {
        0 => Ok(Outcome::Passed),
        1 => Ok(Outcome::TestFailure),
        other => Err(HarnessError::LaunchError(other)),
    }
}

/// Dump the virt machine's device tree to `dest` without booting a guest.
/// The emulator writes the blob and exits immediately.
pub fn dump_dtb(machine: &MachineProfile, dest: &Path) -> Result<(), HarnessError> {
    let mut cmd = Command::new(QEMU_BIN);
    cmd.args([
        "-machine",
        &format!("{},dumpdtb={}", MACHINE_ARGS, dest.display()),
    ]);
    cmd.args(["-cpu", &machine.cpu]);
    cmd.args(["-smp", &machine.cores.to_string()]);
    cmd.args(["-m", &format!("{}M", machine.memory_mb)]);
    cmd.arg("-nographic");
    let status = cmd.status()?;
    if !status.success() {
        return Err(HarnessError::LaunchError(status.code().unwrap_or(-1)));
    }
    if !dest.exists() {
        return Err(HarnessError::LaunchError(-1));
    }
    Ok(())
}
