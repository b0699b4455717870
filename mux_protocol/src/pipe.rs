// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A full-duplex loopback built on `socketpair(2)`.
//!
//! Tests and tools wire two mixers back to back with this: [`pipe`] makes
//! the pair, and [`Endpoint::split`] turns one side into the separate input
//! and output handles a mixer's constructor wants. An endpoint can also be
//! driven directly through `Read`/`Write`, which is how tests play the raw
//! peer and inspect frames on the wire.

use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd;

/// One side of a connected duplex pair.
pub struct Endpoint {
    fd: OwnedFd,
}

/// Create a connected endpoint pair.
pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    Ok((Endpoint::from(a), Endpoint::from(b)))
}

impl Endpoint {
    /// Turn the endpoint into `(input, output)` handles over the same
    /// socket, ready for a mixer's constructor.
    pub fn split(self) -> std::io::Result<(OwnedFd, OwnedFd)> {
        let output = self.fd.try_clone()?;
        Ok((self.fd, output))
    }
}

impl From<OwnedFd> for Endpoint {
    fn from(fd: OwnedFd) -> Endpoint {
        Endpoint { fd }
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match unistd::read(&self.fd, buf) {
                Err(Errno::EINTR) => continue,
                other => return Ok(other?),
            }
        }
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            match unistd::write(&self.fd, buf) {
                Err(Errno::EINTR) => continue,
                other => return Ok(other?),
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
