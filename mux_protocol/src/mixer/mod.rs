// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The channel multiplexer.
//!
//! An [`IoMixer`] carries many isolated byte channels ("slaves") over one
//! full-duplex master transport. Each `add_slave` hands the caller a pair of
//! pipe descriptors: everything written into one comes out of the peer
//! mixer's matching channel, and vice versa.
//!
//! ```text
//! caller --> [slave 1 encoder] \
//! caller --> [slave 2 encoder] --> frames --> master out
//!
//! master in --> [decoder] --> slave 1 pipe --> caller
//!                         \-> slave 2 pipe --> caller
//! ```
//!
//! Channel 0 is reserved: a zero-length frame on it is the whole-transport
//! EOF, exchanged from both sides during [`IoMixer::shutdown`].

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::*;
use nix::unistd;
use task_sync::tracked::Tracked;

use crate::{
    decode_frame_header, encode_frame_header, ChannelError, Error, ProtocolError,
    COMPRESS_THRESHOLD, FLAG_COMPRESSED, FRAME_HEADER_LEN, MAX_FRAME,
};

mod slave;
mod transport;

pub use transport::{CancelFn, Compressor, EndpointType, ReadFn, WriteFn, ZlibCodec};

use slave::Slave;
use transport::{write_all_fd, MasterIn, MasterOut};

/// How long `shutdown` waits for the remote master EOF: ten 100 ms polls.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_TICKS: u32 = 10;

thread_local! {
    /// Marks the frames of a slave-dead callback with the owning mixer, so a
    /// reentrant `shutdown` (which would self-join) can be refused.
    static IN_SLAVE_DEAD: Cell<usize> = const { Cell::new(0) };
}

/// The caller's side of one channel, handed out by [`IoMixer::add_slave`].
pub struct SlaveEndpoints {
    /// The assigned channel id.
    pub id: i32,

    /// Write raw bytes here; the mixer frames them onto the master.
    pub input: OwnedFd,

    /// Read demultiplexed bytes here. EOF on this descriptor reflects the
    /// far side's zero-length frame for the channel.
    pub output: OwnedFd,
}

pub(crate) struct Shared {
    slaves: Mutex<BTreeMap<i32, Arc<Slave>>>,

    master_in: MasterIn,
    master_out: MasterOut,

    /// The master-write mutex. Held across header and payload so the bytes
    /// of one frame are never interleaved with another's.
    master_lock: Mutex<()>,

    cancel_io: Option<CancelFn>,

    compressor: Mutex<Option<Arc<dyn Compressor>>>,

    dead: AtomicBool,
    master_eof_sent: AtomicBool,
    master_eof_received: AtomicBool,
    quiet: AtomicBool,

    decoder_started: AtomicBool,
    decoder: Mutex<Option<thread::JoinHandle<()>>>,

    slave_dead: Mutex<Option<Arc<dyn Fn(i32) + Send + Sync>>>,

    tracked: Tracked,
}

/// The mixer handle. Worker threads keep the underlying state alive through
/// shared references; dropping the last handle shuts the mixer down and
/// joins every task.
pub struct IoMixer {
    shared: Arc<Shared>,
}

impl IoMixer {
    /// Build a mixer around an existing pair of OS handles, each typed
    /// individually as descriptor or socket.
    pub fn new(
        master_in: OwnedFd,
        master_out: OwnedFd,
        in_type: EndpointType,
        out_type: EndpointType,
    ) -> IoMixer {
        debug!("creating mixer from master handles ({in_type:?} in, {out_type:?} out)");

        IoMixer {
            shared: Arc::new(Shared::new(
                MasterIn::from_fd(master_in, in_type),
                MasterOut::from_fd(master_out, out_type),
                None,
            )),
        }
    }

    /// Build a mixer around caller-supplied read/write callbacks. The
    /// callbacks must block until at least one byte of progress is made, or
    /// return `Ok(0)`/`Err` on end-of-stream. `cancel_io` is invoked to
    /// unblock them during shutdown.
    pub fn with_callbacks(read: ReadFn, write: WriteFn, cancel_io: Option<CancelFn>) -> IoMixer {
        debug!("creating mixer from master callbacks");

        IoMixer {
            shared: Arc::new(Shared::new(
                MasterIn::Callback(Mutex::new(read)),
                MasterOut::Callback(Mutex::new(write)),
                cancel_io,
            )),
        }
    }

    /// Inject the optional compression capability. Channels only compress
    /// after [`IoMixer::set_slave_compression`] turns them on.
    pub fn set_compressor(&self, codec: impl Compressor + 'static) {
        self.shared.tracked.assert_live();
        *lock_or_recover(&self.shared.compressor) = Some(Arc::new(codec));
    }

    /// Register a new channel and spawn its encoder.
    ///
    /// Passing `None` allocates the smallest unused positive id; an explicit
    /// id must be positive and unique. Returns the caller-side pipe ends and
    /// the final id. On failure nothing is registered.
    pub fn add_slave(&self, id: Option<i32>) -> Result<SlaveEndpoints, Error> {
        self.shared.tracked.assert_live();

        if self.shared.is_dead() {
            error!("mixer already dead while trying to add a slave");
            return Err(ChannelError::MixerDead.into());
        }

        if let Some(id) = id {
            if id <= 0 {
                error!("channel id {id} is reserved");
                return Err(ChannelError::ReservedId.into());
            }
        }

        // Pipes first: a failure here leaves no trace in the slaves map.
        let (data_in, caller_in) = unistd::pipe().map_err(io::Error::from)?;
        let (caller_out, data_out) = unistd::pipe().map_err(io::Error::from)?;
        let (cancel_rx, cancel_tx) = unistd::pipe().map_err(io::Error::from)?;

        let mut slaves = self.shared.lock_slaves();

        let id = match id {
            Some(id) => {
                if slaves.contains_key(&id) {
                    error!("channel id {id} is not unique");
                    return Err(ChannelError::DuplicateId(id).into());
                }
                id
            }
            None => {
                let mut candidate = 1;
                while slaves.contains_key(&candidate) {
                    candidate += 1;
                }
                candidate
            }
        };

        let record = Arc::new(Slave::new(id, data_in, data_out, cancel_rx, cancel_tx));

        let shared = Arc::clone(&self.shared);
        let encoder = Arc::clone(&record);
        let handle = thread::Builder::new()
            .name(format!("mux-encoder-{id}"))
            .spawn(move || slave::encoder_loop(shared, encoder))
            .map_err(|e| {
                error!("cannot spawn encoder for channel {id}: {e}");
                Error::Io(e)
            })?;

        *lock_or_recover(&record.thread) = Some(handle);
        slaves.insert(id, record);

        debug!("assigned id {id} to new slave");

        Ok(SlaveEndpoints {
            id,
            input: caller_in,
            output: caller_out,
        })
    }

    /// Toggle the compression flag on a channel. Enabling requires a
    /// configured compressor.
    pub fn set_slave_compression(&self, id: i32, enabled: bool) -> Result<(), Error> {
        self.shared.tracked.assert_live();

        let slaves = self.shared.lock_slaves();

        let Some(record) = slaves.get(&id) else {
            error!("cannot toggle compression: channel id {id} does not exist");
            return Err(ChannelError::UnknownId(id).into());
        };

        if enabled {
            if self.shared.compressor().is_none() {
                error!("cannot enable compression on channel {id}: no compressor loaded");
                return Err(ChannelError::CompressorMissing.into());
            }
            record.flags.fetch_or(FLAG_COMPRESSED, Ordering::Relaxed);
            debug!("enabled compression on channel {id}");
        } else {
            record.flags.fetch_and(!FLAG_COMPRESSED, Ordering::Relaxed);
            debug!("disabled compression on channel {id}");
        }

        Ok(())
    }

    /// Cancel a channel's encoder, close its pipes, and drop its record.
    /// Removing an unregistered id is a successful no-op.
    pub fn remove_slave(&self, id: i32) -> Result<(), Error> {
        self.shared.tracked.assert_live();

        let record = self.shared.lock_slaves().remove(&id);
        let Some(record) = record else {
            return Ok(());
        };

        debug!("removing slave id {id}");

        record.cancel();
        join_handle(&record.thread);

        // Dropping the record closes the remaining pipe ends.
        Ok(())
    }

    /// Spawn the master-decoder task. No data reaches any slave before this
    /// call; frames that arrived earlier are processed once it runs.
    pub fn start(&self) -> Result<(), Error> {
        self.shared.tracked.assert_live();

        if self.shared.decoder_started.swap(true, Ordering::AcqRel) {
            debug!("master decoder already started");
            return Ok(());
        }

        debug!("starting master decoder");

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("mux-decoder".into())
            .spawn(move || Shared::decoder_loop(shared))
            .map_err(|e| {
                self.shared.decoder_started.store(false, Ordering::Release);
                error!("cannot spawn master decoder: {e}");
                Error::Io(e)
            })?;

        *lock_or_recover(&self.shared.decoder) = Some(handle);
        Ok(())
    }

    /// Request termination of the decoder task and join it. A pending master
    /// read is cancelled where the transport allows it (socket shutdown, or
    /// the user cancel hook for callback transports).
    pub fn stop(&self) {
        self.shared.tracked.assert_live();

        debug!("stopping master decoder");

        self.shared.dead.store(true, Ordering::Release);
        self.shared
            .master_in
            .cancel(self.shared.cancel_io.as_ref());

        join_handle(&self.shared.decoder);
    }

    /// Graceful teardown: announce EOF on every channel and on the master,
    /// wait a bounded interval for the remote master EOF, then cancel and
    /// join every task and drop every slave.
    ///
    /// A second call is a no-op. Calling this from inside a slave-dead
    /// callback of the same mixer is refused as a programming error.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shared.tracked.assert_live();

        let marker = Arc::as_ptr(&self.shared) as usize;
        if IN_SLAVE_DEAD.with(|cell| cell.get()) == marker {
            error!("shutdown called from a slave-dead callback of the same mixer");
            return Err(ChannelError::ReentrantShutdown.into());
        }

        if self.shared.dead.swap(true, Ordering::AcqRel) {
            debug!("shutdown: mixer already dead");
            return Ok(());
        }

        debug!("shutdown: sending EOF on every channel");
        {
            let slaves = self.shared.lock_slaves();
            for record in slaves.values() {
                if let Err(e) = self.shared.send_channel_eof(record) {
                    self.shared
                        .report(&format!("cannot send EOF for channel {}: {e}", record.id));
                }
            }
        }

        debug!("shutdown: sending master EOF");
        self.shared.send_master_eof();

        // Without a decoder there is nobody to observe the remote EOF.
        if !self.shared.decoder_started.load(Ordering::Acquire) {
            self.shared.master_eof_received.store(true, Ordering::Release);
        }

        let mut ticks = SHUTDOWN_TICKS;
        while !self.shared.master_eof_received.load(Ordering::Acquire) && ticks > 0 {
            thread::sleep(SHUTDOWN_POLL);
            ticks -= 1;
        }

        // The interval expiring means the connection is considered broken.
        if !self.shared.master_eof_received.swap(true, Ordering::AcqRel) {
            warn!("shutdown: timeout waiting for the remote master EOF");
        }

        self.flush();
        self.stop();

        let ids: Vec<i32> = self.shared.lock_slaves().keys().copied().collect();
        for id in ids {
            let _ = self.remove_slave(id);
        }

        Ok(())
    }

    /// Signal every slave's cancellation and join its encoder task.
    pub fn flush(&self) {
        self.shared.tracked.assert_live();

        let records: Vec<Arc<Slave>> = self.shared.lock_slaves().values().cloned().collect();

        for record in records {
            debug!("flushing slave id {}", record.id);
            record.cancel();
            join_handle(&record.thread);
        }
    }

    /// Wait until the decoder task and every encoder task have finished.
    pub fn join(&self) {
        self.flush();
        join_handle(&self.shared.decoder);
    }

    /// Register a callback fired exactly once per channel when its encoder
    /// finishes; channel 0 corresponds to the decoder exiting.
    pub fn set_slave_dead_callback(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        self.shared.tracked.assert_live();
        *lock_or_recover(&self.shared.slave_dead) = Some(Arc::new(callback));
    }

    /// Demote errors on the expected teardown path to debug logs.
    pub fn set_quiet_mode(&self, quiet: bool) {
        self.shared.quiet.store(quiet, Ordering::Relaxed);
    }
}

impl Drop for IoMixer {
    fn drop(&mut self) {
        if !self.shared.is_dead() {
            let _ = self.shutdown();
        }
        self.join();
    }
}

impl Shared {
    fn new(master_in: MasterIn, master_out: MasterOut, cancel_io: Option<CancelFn>) -> Shared {
        Shared {
            slaves: Mutex::new(BTreeMap::new()),
            master_in,
            master_out,
            master_lock: Mutex::new(()),
            cancel_io,
            compressor: Mutex::new(None),
            dead: AtomicBool::new(false),
            master_eof_sent: AtomicBool::new(false),
            master_eof_received: AtomicBool::new(false),
            quiet: AtomicBool::new(false),
            decoder_started: AtomicBool::new(false),
            decoder: Mutex::new(None),
            slave_dead: Mutex::new(None),
            tracked: Tracked::new("IoMixer"),
        }
    }

    pub(super) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn lock_slaves(&self) -> MutexGuard<'_, BTreeMap<i32, Arc<Slave>>> {
        lock_or_recover(&self.slaves)
    }

    fn compressor(&self) -> Option<Arc<dyn Compressor>> {
        lock_or_recover(&self.compressor).clone()
    }

    /// Route a failure through the logging policy: errors during an expected
    /// teardown are only interesting at debug level.
    pub(super) fn report(&self, message: &str) {
        if self.quiet.load(Ordering::Relaxed) {
            debug!("{message}");
        } else {
            error!("{message}");
        }
    }

    /// Frame `payload` for channel `id` and write it to the master in one
    /// atomic sequence.
    ///
    /// With the compression flag set, payloads above the threshold are run
    /// through the compressor; the flag bit is cleared when the result fails
    /// to shrink (or no compressor is loaded), so every frame on the wire
    /// stays within the ceiling.
    pub(super) fn master_encode(&self, id: i32, payload: &[u8], mut flags: u8) -> Result<(), Error> {
        let compressed: Option<Vec<u8>> = if flags & FLAG_COMPRESSED != 0 {
            match self.compressor() {
                Some(codec) if payload.len() > COMPRESS_THRESHOLD => {
                    let packed = codec.compress(payload)?;
                    if packed.len() < payload.len() {
                        trace!(
                            "channel {id}: compressed {} bytes into {}",
                            payload.len(),
                            packed.len()
                        );
                        Some(packed)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        } else {
            None
        };

        let body = match &compressed {
            Some(packed) => packed.as_slice(),
            None => {
                flags &= !FLAG_COMPRESSED;
                payload
            }
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        encode_frame_header(&mut frame, id, flags, body.len() as i32);
        frame.extend_from_slice(body);

        let _write = lock_or_recover(&self.master_lock);

        // Master EOF declared "we will send nothing more": keep the promise.
        if self.master_eof_sent.load(Ordering::Acquire) {
            debug!("master EOF already sent, frame for channel {id} dropped");
            return Ok(());
        }

        self.master_out.write_all(&frame)?;

        trace!("wrote {} payload bytes for channel {id} to master", body.len());
        Ok(())
    }

    /// Emit the channel's zero-length frame, once. The check, the write and
    /// the flag update all happen under the master-write mutex.
    pub(super) fn send_channel_eof(&self, record: &Slave) -> Result<(), Error> {
        let _write = lock_or_recover(&self.master_lock);

        if record.eof_sent.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.master_eof_sent.load(Ordering::Acquire) {
            debug!("master EOF already sent, EOF for channel {} dropped", record.id);
            return Ok(());
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN);
        encode_frame_header(&mut frame, record.id, 0, 0);
        self.master_out.write_all(&frame)?;

        record.eof_sent.store(true, Ordering::Release);
        debug!("sent EOF on channel {}", record.id);
        Ok(())
    }

    /// Emit the channel-0 zero-length frame that closes the whole transport.
    pub(super) fn send_master_eof(&self) {
        let _write = lock_or_recover(&self.master_lock);

        if self.master_eof_sent.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN);
        encode_frame_header(&mut frame, 0, 0, 0);

        if let Err(e) = self.master_out.write_all(&frame) {
            self.report(&format!("cannot send master EOF: {e}"));
        }
    }

    /// The master-decoder task: split one master input back into the
    /// per-slave pipes until the remote master EOF (or a broken connection).
    fn decoder_loop(shared: Arc<Shared>) {
        let mut wire = vec![0u8; MAX_FRAME];
        let mut decoded = vec![0u8; MAX_FRAME];

        while !shared.master_eof_received.load(Ordering::Acquire) {
            let mut head = [0u8; FRAME_HEADER_LEN];
            if let Err(e) = shared.master_in.read_exact(&mut head) {
                shared.report(&format!("cannot read frame header from master: {e}"));
                break;
            }

            let (id, flags, length) = decode_frame_header(&head);

            if length < 0 || length as usize > MAX_FRAME {
                shared.report(&format!("{}", ProtocolError::Oversize(length)));
                break;
            }
            let length = length as usize;

            if length == 0 {
                if id == 0 {
                    debug!("received EOF on master channel 0");
                    shared.master_eof_received.store(true, Ordering::Release);
                } else {
                    shared.channel_eof_received(id);
                }
                continue;
            }

            if let Err(e) = shared.master_in.read_exact(&mut wire[..length]) {
                shared.report(&format!("cannot read frame payload from master: {e}"));
                break;
            }

            let payload: &[u8] = if flags & FLAG_COMPRESSED != 0 {
                let Some(codec) = shared.compressor() else {
                    shared.report(&format!("{}", ProtocolError::CompressedWithoutCodec));
                    break;
                };

                match codec.uncompress(&wire[..length], &mut decoded) {
                    Ok(n) => &decoded[..n],
                    Err(e) => {
                        shared.report(&format!("cannot uncompress frame for channel {id}: {e}"));
                        break;
                    }
                }
            } else {
                &wire[..length]
            };

            shared.deliver(id, payload);
        }

        // Leaving the loop without having seen the handshake frame means the
        // connection broke underneath us.
        if !shared.master_eof_received.swap(true, Ordering::AcqRel) {
            shared.report("master connection broken");
        }

        trace!("master decoder finished");

        shared.fire_slave_dead(0);
    }

    /// The far side announced EOF for one channel: record it and close the
    /// inbound pipe so the caller's read side drains to EOF.
    fn channel_eof_received(&self, id: i32) {
        debug!("received EOF on channel {id}");

        let slaves = self.lock_slaves();

        if let Some(record) = slaves.get(&id) {
            record.eof_received.store(true, Ordering::Release);
            *lock_or_recover(&record.data_out) = None;
        } else {
            debug!("EOF for unknown channel {id} ignored");
        }
    }

    /// Hand a decoded payload to its slave's inbound pipe.
    fn deliver(&self, id: i32, payload: &[u8]) {
        let record = self.lock_slaves().get(&id).cloned();

        let Some(record) = record else {
            error!(
                "frame for unknown channel {id}: {} bytes dropped",
                payload.len()
            );
            return;
        };

        if record.eof_sent.load(Ordering::Acquire) || record.eof_received.load(Ordering::Acquire) {
            debug!(
                "channel {id} already saw EOF, {} bytes dropped",
                payload.len()
            );
            return;
        }

        let pipe = lock_or_recover(&record.data_out);
        match pipe.as_ref() {
            Some(fd) => {
                if let Err(e) = write_all_fd(fd, payload) {
                    self.report(&format!("cannot write to channel {id}: {e}"));
                }
            }
            None => debug!(
                "channel {id} inbound pipe closed, {} bytes dropped",
                payload.len()
            ),
        }
    }

    /// Tell the caller a channel's task finished. Fired once per encoder
    /// exit, and with id 0 when the decoder exits.
    pub(super) fn fire_slave_dead(self: &Arc<Self>, id: i32) {
        let callback = lock_or_recover(&self.slave_dead).clone();

        if let Some(callback) = callback {
            let marker = Arc::as_ptr(self) as usize;
            IN_SLAVE_DEAD.with(|cell| cell.set(marker));
            callback(id);
            IN_SLAVE_DEAD.with(|cell| cell.set(0));
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Join a worker unless that would mean joining ourselves.
fn join_handle(slot: &Mutex<Option<thread::JoinHandle<()>>>) {
    let handle = lock_or_recover(slot).take();

    if let Some(handle) = handle {
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let _ = handle.join();
    }
}
