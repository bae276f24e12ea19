use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use boot_harness::config::{load_config, HarnessConfig};
use boot_harness::dtb::patch_bootargs;
use boot_harness::image::assemble_image;
use boot_harness::manifest::write_manifest;
use boot_harness::preflight::check_host_tools;
use boot_harness::qemu::{self, EmulationRequest, Outcome};
use boot_harness::HarnessError;

fn usage() -> &'static str {
    "Usage:\n  boot-harness build <config.toml>\n  boot-harness patch-dtb <input.dtb> <output.dtb> <bootargs...>\n  boot-harness dump-dtb <config.toml> <output.dtb>\n  boot-harness run <config.toml>\n  boot-harness test <config.toml>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let outcome = match args.as_slice() {
        [cmd, config] if cmd == "build" => {
            build(&load(config)?)?;
            Outcome::Passed
        }
        [cmd, input, output, bootargs @ ..] if cmd == "patch-dtb" && !bootargs.is_empty() => {
            patch_dtb_file(Path::new(input), Path::new(output), &bootargs.join(" "))?;
            Outcome::Passed
        }
        [cmd, config, output] if cmd == "dump-dtb" => {
            let config = load(config)?;
            qemu::dump_dtb(&config.machine, Path::new(output))
                .context("dumping device tree from the emulator")?;
            println!("Device tree written to {}", output);
            Outcome::Passed
        }
        [cmd, config] if cmd == "run" => run_guest(&load(config)?)?,
        [cmd, config] if cmd == "test" => {
            let config = load(config)?;
            build(&config)?;
            run_guest(&config)?
        }
        _ => bail!(usage()),
    };

    match outcome {
        Outcome::Passed => Ok(()),
        Outcome::TestFailure => std::process::exit(1),
    }
}

fn load(path: &str) -> Result<HarnessConfig> {
    load_config(Path::new(path))
}

/// Assemble the disk image described by the configuration and record its
/// manifest. The image path is locked for the duration so concurrent builds
/// against the same output serialize instead of corrupting each other.
fn build(config: &HarnessConfig) -> Result<()> {
    if let Some(parent) = config.image_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating output directory '{}'", parent.display())
            })?;
        }
    }

    let lock_path = PathBuf::from(format!("{}.lock", config.image_path.display()));
    let lock = File::create(&lock_path)
        .with_context(|| format!("creating build lock '{}'", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("acquiring build lock '{}'", lock_path.display()))?;

    let layout = config.plan_layout()?;
    let files = config.boot_file_set()?;
    assemble_image(
        &config.image_path,
        config.image_size_bytes,
        &layout,
        &files,
        config.rootfs.as_deref(),
    )
    .with_context(|| format!("assembling image '{}'", config.image_path.display()))?;

    let manifest = write_manifest(&config.image_path, &layout)?;
    println!("Manifest written to {}", manifest.display());

    fs2::FileExt::unlock(&lock)
        .with_context(|| format!("releasing build lock '{}'", lock_path.display()))?;
    Ok(())
}

fn patch_dtb_file(input: &Path, output: &Path, bootargs: &str) -> Result<()> {
    let blob = fs::read(input)
        .with_context(|| format!("reading device tree '{}'", input.display()))?;
    let patched = patch_bootargs(&blob, bootargs)
        .with_context(|| format!("patching device tree '{}'", input.display()))?;
    fs::write(output, patched)
        .with_context(|| format!("writing patched device tree '{}'", output.display()))?;
    println!("Patched device tree written to {}", output.display());
    Ok(())
}

/// Launch the guest. When bootargs are configured, a machine device tree is
/// dumped and patched first so the guest sees them in `chosen`.
fn run_guest(config: &HarnessConfig) -> Result<Outcome> {
    check_host_tools()?;

    let dtb = prepare_dtb(config)?;
    let request = EmulationRequest {
        hypervisor: config.artifacts.hypervisor.clone(),
        images: vec![config.image_path.clone()],
        dtb,
        machine: config.machine.clone(),
    };

    match qemu::run(&request) {
        Ok(outcome) => {
            match outcome {
                Outcome::Passed => println!("=== Guest run passed ==="),
                Outcome::TestFailure => eprintln!("=== Guest reported a test failure ==="),
            }
            Ok(outcome)
        }
        Err(HarnessError::LaunchError(code)) => {
            eprintln!("Emulator exited abnormally (code {})", code);
            std::process::exit(2);
        }
        Err(err) => Err(err.into()),
    }
}

/// Resolve the device tree to pass to the emulator, if any.
///
/// A configured `artifacts.dtb` is used as-is; configured `bootargs` without
/// a blob trigger a dump-then-patch of the virt machine's own tree. With
/// neither, QEMU synthesizes its default tree.
fn prepare_dtb(config: &HarnessConfig) -> Result<Option<PathBuf>> {
    let bootargs = match &config.artifacts.bootargs {
        Some(args) => args,
        None => return Ok(config.artifacts.dtb.clone()),
    };

    let base = match &config.artifacts.dtb {
        Some(path) => path.clone(),
        None => {
            let dumped = PathBuf::from(format!("{}.dump.dtb", config.image_path.display()));
            qemu::dump_dtb(&config.machine, &dumped)
                .context("dumping device tree from the emulator")?;
            dumped
        }
    };

    let patched = PathBuf::from(format!("{}.patched.dtb", config.image_path.display()));
    patch_dtb_file(&base, &patched, bootargs)?;
    Ok(Some(patched))
}
