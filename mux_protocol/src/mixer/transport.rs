// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The master transport: one read handle and one write handle, each either a
//! plain file descriptor, a socket, or a caller-supplied callback. The type
//! decides which system primitive moves the bytes and how a pending read is
//! kicked loose during shutdown.

use std::io;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags, Shutdown};
use nix::unistd;

/// How an OS handle should be driven: `read`/`write` for plain descriptors,
/// `recv`/`send` for sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Fd,
    Socket,
}

/// Callback transports must block until at least one byte of progress is
/// made, and return `Ok(0)` (or an error) on end-of-stream.
pub type ReadFn = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
pub type WriteFn = Box<dyn FnMut(&[u8]) -> io::Result<usize> + Send>;

/// Invoked to force a blocked callback read or write to return during
/// shutdown.
pub type CancelFn = Box<dyn Fn() + Send + Sync>;

pub(crate) enum MasterIn {
    Fd(OwnedFd),
    Socket(OwnedFd),
    Callback(Mutex<ReadFn>),
}

impl MasterIn {
    pub(crate) fn from_fd(fd: OwnedFd, kind: EndpointType) -> MasterIn {
        match kind {
            EndpointType::Fd => MasterIn::Fd(fd),
            EndpointType::Socket => MasterIn::Socket(fd),
        }
    }

    /// One blocking read. `Ok(0)` is end of stream.
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MasterIn::Fd(fd) => loop {
                match unistd::read(fd, buf) {
                    Err(Errno::EINTR) => continue,
                    other => return Ok(other?),
                }
            },
            MasterIn::Socket(fd) => loop {
                match socket::recv(fd.as_raw_fd(), buf, MsgFlags::empty()) {
                    Err(Errno::EINTR) => continue,
                    other => return Ok(other?),
                }
            },
            MasterIn::Callback(read) => {
                let mut read = match read.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                read(buf)
            }
        }
    }

    /// Fill `buf` completely; a premature end of stream is an error.
    pub(crate) fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;

        while done < buf.len() {
            match self.read_some(&mut buf[done..])? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => done += n,
            }
        }

        Ok(())
    }

    /// Unblock a pending read. Sockets get their read side shut down, a
    /// callback transport gets the caller's cancel hook; a plain descriptor
    /// has no cancel primitive and ends at the peer's EOF.
    pub(crate) fn cancel(&self, cancel_io: Option<&CancelFn>) {
        match self {
            MasterIn::Socket(fd) => {
                let _ = socket::shutdown(fd.as_raw_fd(), Shutdown::Read);
            }
            MasterIn::Callback(_) => {
                if let Some(cancel) = cancel_io {
                    cancel();
                }
            }
            // TODO: give plain descriptors a cancel path too, by pairing the
            // master read with a self-pipe in a select, the way the slave
            // encoders already do.
            MasterIn::Fd(_) => {}
        }
    }
}

pub(crate) enum MasterOut {
    Fd(OwnedFd),
    Socket(OwnedFd),
    Callback(Mutex<WriteFn>),
}

impl MasterOut {
    pub(crate) fn from_fd(fd: OwnedFd, kind: EndpointType) -> MasterOut {
        match kind {
            EndpointType::Fd => MasterOut::Fd(fd),
            EndpointType::Socket => MasterOut::Socket(fd),
        }
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MasterOut::Fd(fd) => loop {
                match unistd::write(fd, buf) {
                    Err(Errno::EINTR) => continue,
                    other => return Ok(other?),
                }
            },
            MasterOut::Socket(fd) => loop {
                match socket::send(fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                    Err(Errno::EINTR) => continue,
                    other => return Ok(other?),
                }
            },
            MasterOut::Callback(write) => {
                let mut write = match write.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                write(buf)
            }
        }
    }

    pub(crate) fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;

        while done < buf.len() {
            match self.write_some(&buf[done..])? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => done += n,
            }
        }

        Ok(())
    }
}

/// Write every byte of `buf` into a pipe descriptor.
pub(crate) fn write_all_fd(fd: &OwnedFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;

    while done < buf.len() {
        match unistd::write(fd, &buf[done..]) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => done += n,
        }
    }

    Ok(())
}

/// The optional compression capability consulted for frames whose channel
/// has the compression flag enabled.
///
/// When no compressor is configured, compression is silently disabled and
/// frames travel raw with the flag bit cleared.
pub trait Compressor: Send + Sync {
    /// Compress `src`, returning the compressed bytes.
    fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>>;

    /// Expand `src` into `dst`, returning the decompressed length. `dst`
    /// must be at least as large as the original payload.
    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> io::Result<usize>;

    /// Worst-case compressed size for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;
}

/// The stock [`Compressor`]: zlib streams via flate2.
pub struct ZlibCodec {
    level: Compression,
}

impl ZlibCodec {
    pub fn new() -> ZlibCodec {
        ZlibCodec {
            level: Compression::default(),
        }
    }
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZlibCodec {
    fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder =
            ZlibEncoder::new(Vec::with_capacity(self.compress_bound(src.len())), self.level);
        encoder.write_all(src)?;
        encoder.finish()
    }

    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> io::Result<usize> {
        let mut inflater = Decompress::new(true);

        let status = inflater
            .decompress(src, dst, FlushDecompress::Finish)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if status != Status::StreamEnd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated zlib stream or undersized output buffer",
            ));
        }

        Ok(inflater.total_out() as usize)
    }

    fn compress_bound(&self, len: usize) -> usize {
        // The classic zlib bound: source + 0.1% + 12, padded a little.
        len + len / 1000 + 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trip() {
        let codec = ZlibCodec::new();
        let original = vec![7u8; 4096];

        let packed = codec.compress(&original).unwrap();
        assert!(packed.len() < original.len());

        let mut out = vec![0u8; 4096];
        let n = codec.uncompress(&packed, &mut out).unwrap();
        assert_eq!(n, original.len());
        assert_eq!(out[..n], original[..]);
    }

    #[test]
    fn undersized_output_buffer_is_an_error() {
        let codec = ZlibCodec::new();
        let packed = codec.compress(&[0u8; 1024]).unwrap();

        let mut out = vec![0u8; 16];
        assert!(codec.uncompress(&packed, &mut out).is_err());
    }
}
