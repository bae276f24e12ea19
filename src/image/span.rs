//! A read/write/seek window over one partition span of the backing image.
//!
//! Scopes all I/O of a volume builder to its partition: positions are
//! relative to the span start, reads clamp at the span end, and writes past
//! the end report zero bytes written (so `write_all` fails instead of
//! spilling into the next partition).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::image::layout::Partition;

pub struct SpanView<'a> {
    file: &'a mut File,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a> SpanView<'a> {
    pub fn new(file: &'a mut File, partition: &Partition) -> Self {
        Self {
            file,
            start: partition.byte_offset(),
            len: partition.byte_len(),
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }
}

impl Read for SpanView<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.remaining().min(buf.len() as u64) as usize;
        if limit == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..limit])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for SpanView<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.remaining().min(buf.len() as u64) as usize;
        if limit == 0 {
            // Signals WriteZero to write_all rather than growing past the span.
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.write(&buf[..limit])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for SpanView<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::End(n) => i128::from(self.len) + i128::from(n),
            SeekFrom::Current(n) => i128::from(self.pos) + i128::from(n),
        };
        if target < 0 || target > i128::from(u64::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the span",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
