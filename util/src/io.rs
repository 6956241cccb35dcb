//! Helpers for performing non-blocking IO
//!
//! Sockets registered with mio are non-blocking; reads and writes return
//! [io::ErrorKind::WouldBlock] when the socket is drained or full and may
//! return [io::ErrorKind::Interrupted] at any time. The helpers here fold
//! those two cases into the return value.
//!
//! ```
//! use std::io::Cursor;
//! use bip15x_util::io::ReadNonblockingExt;
//!
//! let mut src = Cursor::new(vec![1u8, 2, 3]);
//! let mut buf = [0u8; 8];
//! assert_eq!(src.read_nonblocking(&mut buf)?, Some(3));
//! assert_eq!(&buf[..3], &[1, 2, 3]);
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;

/// Automatically handles `std::io::ErrorKind::{WouldBlock, Interrupted}`.
///
/// - If there is no error (i.e. on `Ok(r)`), the function will return `Ok(Some(r))`
/// - `Interrupted` is handled internally, by retrying the IO operation
/// - `WouldBlock` is handled by returning `Ok(None)`,
/// - Other errors are returned as is
pub fn nonblocking_handle_io_errors<R, F>(mut iofn: F) -> io::Result<Option<R>>
where
    F: FnMut() -> io::Result<R>,
{
    use io::ErrorKind as E;
    loop {
        match iofn() {
            Ok(v) => return Ok(Some(v)),
            Err(e) if e.kind() == E::WouldBlock => return Ok(None),
            Err(e) if e.kind() == E::Interrupted => continue,
            Err(e) => return Err(e),
        };
    }
}

/// [io::Read] extension for non-blocking sources
pub trait ReadNonblockingExt {
    /// Read once; `Ok(None)` means the source is drained for now
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl<T: io::Read> ReadNonblockingExt for T {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        nonblocking_handle_io_errors(|| self.read(buf))
    }
}

/// [io::Write] extension for non-blocking sinks
pub trait WriteNonblockingExt {
    /// Write as much of `buf` as the sink accepts right now
    ///
    /// Returns the number of bytes written; zero means the sink is full.
    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: io::Write> WriteNonblockingExt for T {
    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut off = 0;
        while off < buf.len() {
            match nonblocking_handle_io_errors(|| self.write(&buf[off..]))? {
                None => break,
                Some(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport refused to accept more bytes",
                    ))
                }
                Some(n) => off += n,
            }
        }
        Ok(off)
    }
}
