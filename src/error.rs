//! Error taxonomy for image building, device-tree patching and emulation.
//!
//! Core modules return [`HarnessError`] so callers can match on the exact
//! failure; the CLI and config layers wrap these in `anyhow` with added
//! context. Every variant carries enough detail (offending span, node name,
//! missing file) to diagnose a failure without re-running with tracing.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The requested partition layout violates an invariant
    /// (overlap, misalignment, more than one bootable partition, ...).
    #[error("invalid disk layout: {0}")]
    InvalidLayout(String),

    /// The image is too small to hold the requested partitions.
    #[error("insufficient space: layout needs {needed} bytes but the image holds {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    /// A partition span cannot hold what must be written into it.
    #[error("span of {span_bytes} bytes too small: {detail}")]
    SpanTooSmall { span_bytes: u64, detail: String },

    /// A source byte stream could not be fully read.
    #[error("reading source '{path}': {source}")]
    SourceReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The `chosen` node already defines `bootargs`. Overwriting boot
    /// parameters is a caller decision, never done silently.
    #[error("device tree 'chosen' node already defines a bootargs property")]
    BootargsAlreadyPresent,

    /// The device tree has no `chosen` node to patch.
    #[error("device tree has no 'chosen' node")]
    ChosenNodeMissing,

    /// The input blob is not a well-formed flattened device tree.
    #[error("decoding device tree blob: {0}")]
    DecodeError(String),

    /// The tree cannot be re-encoded as a flattened device tree.
    #[error("encoding device tree blob: {0}")]
    EncodeError(String),

    /// The emulator exited with a code outside the pass/fail contract.
    #[error("emulator exited with unexpected code {0}")]
    LaunchError(i32),

    /// I/O on the backing image or emulator process.
    #[error(transparent)]
    Io(#[from] io::Error),
}
