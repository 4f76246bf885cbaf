//! Small `Read`/`Write` adapters shared by the file copier and the page
//! codec: counting bytes actually written (post-compression, for byte
//! accounting) and computing a running CRC32C over bytes as they're
//! produced (pre-compression, since that's what a restore verifies
//! against).

use std::io::{self, Read, Write};

pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        CountingWriter { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams all of `reader` into `writer`, returning `(bytes copied, crc32c
/// of the bytes as read)`.
pub fn copy_with_crc<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<(u64, u32)> {
    let mut buf = [0u8; 64 * 1024];
    let mut crc = 0u32;
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        total += n as u64;
    }
    Ok((total, crc))
}
