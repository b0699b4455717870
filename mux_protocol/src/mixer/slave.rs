// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-channel state and the slave-encoder task.
//!
//! One slave = one channel = one encoder thread. The encoder drains the
//! caller's outbound pipe and wraps every read into a frame on the master:
//!
//! ```text
//! -> <data1> -> [slave 1] \
//!                          -> <1><len1><data1> <2><len2><data2> -> master ->
//! -> <data2> -> [slave 2] /
//! ```

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::*;
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::unistd;

use super::Shared;
use crate::MAX_FRAME;

pub(super) enum Readable {
    Data,
    Cancelled,
}

pub(super) struct Slave {
    pub(super) id: i32,

    /// Per-frame flag bits for this channel (compression on/off).
    pub(super) flags: AtomicU8,

    /// This side has emitted the channel's zero-length frame.
    pub(super) eof_sent: AtomicBool,

    /// The far side has emitted the channel's zero-length frame.
    pub(super) eof_received: AtomicBool,

    /// Read end of the outbound pipe; the encoder drains what the caller
    /// writes into its end.
    data_in: OwnedFd,

    /// Write end of the inbound pipe; the decoder fills what the caller
    /// reads. Dropped when the far side sends this channel's EOF, which is
    /// what delivers EOF to the caller's read side. The mutex also
    /// serialises writes into the pipe.
    pub(super) data_out: Mutex<Option<OwnedFd>>,

    /// Self-pipe observed by the encoder's `select` alongside the data pipe;
    /// one byte on it aborts a blocked read.
    cancel_rx: OwnedFd,
    cancel_tx: OwnedFd,

    pub(super) thread: Mutex<Option<JoinHandle<()>>>,
}

impl Slave {
    pub(super) fn new(
        id: i32,
        data_in: OwnedFd,
        data_out: OwnedFd,
        cancel_rx: OwnedFd,
        cancel_tx: OwnedFd,
    ) -> Slave {
        Slave {
            id,
            flags: AtomicU8::new(0),
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            data_in,
            data_out: Mutex::new(Some(data_out)),
            cancel_rx,
            cancel_tx,
            thread: Mutex::new(None),
        }
    }

    /// Ask the encoder to abandon its current read. The encoder exits
    /// without emitting any further frame, not even an EOF.
    pub(super) fn cancel(&self) {
        if unistd::write(&self.cancel_tx, b"x").is_err() {
            debug!("cannot signal cancel for channel {}", self.id);
        }
    }

    /// Block until the data pipe is readable or the cancel pipe fires;
    /// cancellation wins when both are ready.
    fn wait_readable(&self) -> io::Result<Readable> {
        loop {
            let mut readable = FdSet::new();
            readable.insert(self.data_in.as_fd());
            readable.insert(self.cancel_rx.as_fd());

            match select(None, &mut readable, None, None, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }

            if readable.contains(self.cancel_rx.as_fd()) {
                return Ok(Readable::Cancelled);
            }

            if readable.contains(self.data_in.as_fd()) {
                return Ok(Readable::Data);
            }
        }
    }

    fn read_data(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match unistd::read(&self.data_in, buf) {
                Err(Errno::EINTR) => continue,
                other => return Ok(other?),
            }
        }
    }
}

/// The slave-encoder task. Runs until the caller closes its write end, the
/// slave is cancelled, or a master write fails; then reports the channel as
/// dead exactly once.
pub(super) fn encoder_loop(shared: Arc<Shared>, slave: Arc<Slave>) {
    let mut buf = vec![0u8; MAX_FRAME];
    let id = slave.id;

    while !shared.is_dead() {
        let read = match slave.wait_readable() {
            Ok(Readable::Cancelled) => {
                debug!("read cancelled on channel {id}");
                break;
            }
            Ok(Readable::Data) => match slave.read_data(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    debug!("channel {id}: read failed: {e}");
                    break;
                }
            },
            Err(e) => {
                warn!("channel {id}: select failed: {e}");
                break;
            }
        };

        if read == 0 {
            // The caller closed its write end: announce the channel's EOF.
            if let Err(e) = shared.send_channel_eof(&slave) {
                shared.report(&format!("cannot send EOF for channel {id}: {e}"));
            }
            break;
        }

        trace!("channel {id}: read {read} bytes from the caller");

        let flags = slave.flags.load(Ordering::Relaxed);
        if let Err(e) = shared.master_encode(id, &buf[..read], flags) {
            shared.report(&format!("cannot encode frame for channel {id}: {e}"));
            break;
        }
    }

    trace!("encoder for channel {id} finished");

    shared.fire_slave_dead(id);
}
