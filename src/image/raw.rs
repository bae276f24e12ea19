//! Raw partition writer: streams an opaque payload into a partition span.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::HarnessError;
use crate::image::layout::Partition;

const COPY_BUF_BYTES: usize = 1024 * 1024;

/// Copy the payload byte-for-byte into the partition span.
///
/// If the payload is shorter than the span the trailing bytes keep their
/// prior value; callers wanting a clean tail must pre-zero the image. The
/// size check happens before any write, so a too-long payload leaves the
/// span unmodified. All writes are made durable before returning success.
pub fn write_raw_partition(
    file: &mut File,
    partition: &Partition,
    payload: &Path,
) -> Result<(), HarnessError> {
    let meta = fs::metadata(payload).map_err(|e| HarnessError::SourceReadError {
        path: payload.to_path_buf(),
        source: e,
    })?;
    let span_bytes = partition.byte_len();
    if meta.len() > span_bytes {
        return Err(HarnessError::SpanTooSmall {
            span_bytes,
            detail: format!(
                "payload '{}' is {} bytes",
                payload.display(),
                meta.len()
            ),
        });
    }

    let source = File::open(payload).map_err(|e| HarnessError::SourceReadError {
        path: payload.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(source);
    file.seek(SeekFrom::Start(partition.byte_offset()))?;

    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| HarnessError::SourceReadError {
                path: payload.to_path_buf(),
                source: e,
            })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }

    // Completion barrier: the payload is on disk when we report success.
    file.sync_all()?;
    Ok(())
}
