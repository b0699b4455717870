// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end tests driving two mixers back to back over a socketpair, plus
//! raw-peer tests that inspect the frames on the wire.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mux_protocol::fifo::Fifo;
use mux_protocol::mixer::{Compressor, EndpointType, IoMixer, ZlibCodec};
use mux_protocol::{pipe, ChannelError, Error, FLAG_COMPRESSED, MAX_FRAME};
use task_sync::Semaphore;

/// Wrap one side of a socketpair as a mixer (the pair is full duplex, so
/// input and output are duplicated handles on the same socket).
fn socket_mixer(endpoint: pipe::Endpoint) -> IoMixer {
    let (master_in, master_out) = endpoint.split().unwrap();
    IoMixer::new(
        master_in,
        master_out,
        EndpointType::Socket,
        EndpointType::Socket,
    )
}

fn mixer_pair() -> (IoMixer, IoMixer) {
    let (a, b) = pipe::pipe().unwrap();
    (socket_mixer(a), socket_mixer(b))
}

/// Drive the two-sided EOF handshake to completion from both ends.
fn shutdown_pair(a: IoMixer, b: IoMixer) {
    let remote = thread::spawn(move || {
        a.shutdown().unwrap();
        a.join();
    });

    b.shutdown().unwrap();
    b.join();
    remote.join().unwrap();
}

fn read_frame_header(peer: &mut pipe::Endpoint) -> (i32, u8, i32) {
    let mut head = [0u8; 9];
    peer.read_exact(&mut head).unwrap();

    (
        i32::from_le_bytes(head[0..4].try_into().unwrap()),
        head[4],
        i32::from_le_bytes(head[5..9].try_into().unwrap()),
    )
}

fn read_bytes(file: &mut File, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    file.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn echo_across_one_channel() {
    let (a, b) = mixer_pair();

    let a_side = a.add_slave(Some(1)).unwrap();
    let b_side = b.add_slave(Some(1)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let mut a_input = File::from(a_side.input);
    let mut b_output = File::from(b_side.output);

    a_input.write_all(&[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(read_bytes(&mut b_output, 3), [0x01, 0x02, 0x03]);

    // And the other direction over the same channel.
    let mut b_input = File::from(b_side.input);
    let mut a_output = File::from(a_side.output);
    b_input.write_all(b"pong").unwrap();
    assert_eq!(read_bytes(&mut a_output, 4), b"pong");

    shutdown_pair(a, b);
}

#[test]
fn zero_length_writes_produce_no_frames() {
    let (a, b) = mixer_pair();

    let a_side = a.add_slave(Some(1)).unwrap();
    let b_side = b.add_slave(Some(1)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let mut a_input = File::from(a_side.input);
    a_input.write_all(b"").unwrap();
    a_input.write_all(b"xyz").unwrap();

    // Were the empty write a frame, it would be an EOF and "xyz" would
    // never arrive.
    let mut b_output = File::from(b_side.output);
    assert_eq!(read_bytes(&mut b_output, 3), b"xyz");

    shutdown_pair(a, b);
}

#[test]
fn channels_do_not_interleave() {
    let (a, b) = mixer_pair();

    let a_one = a.add_slave(Some(1)).unwrap();
    let a_two = a.add_slave(Some(2)).unwrap();
    let b_one = b.add_slave(Some(1)).unwrap();
    let b_two = b.add_slave(Some(2)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let mut in_one = File::from(a_one.input);
    let mut in_two = File::from(a_two.input);
    in_one.write_all(b"aaaa").unwrap();
    in_two.write_all(b"bbbb").unwrap();
    in_one.write_all(b"cccc").unwrap();

    let mut out_one = File::from(b_one.output);
    let mut out_two = File::from(b_two.output);

    // Per-channel FIFO order; nothing from channel 2 bleeds into channel 1.
    assert_eq!(read_bytes(&mut out_one, 8), b"aaaacccc");
    assert_eq!(read_bytes(&mut out_two, 4), b"bbbb");

    shutdown_pair(a, b);
}

#[test]
fn per_channel_eof_leaves_other_channels_open() {
    let (a, b) = mixer_pair();

    let a_one = a.add_slave(Some(1)).unwrap();
    let a_two = a.add_slave(Some(2)).unwrap();
    let b_one = b.add_slave(Some(1)).unwrap();
    let b_two = b.add_slave(Some(2)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let mut in_one = File::from(a_one.input);
    in_one.write_all(b"zz").unwrap();
    drop(in_one); // close of the caller-write fd announces the channel EOF

    let mut out_one = File::from(b_one.output);
    assert_eq!(read_bytes(&mut out_one, 2), b"zz");

    // Exactly one EOF, observed only after every byte was delivered.
    let mut rest = Vec::new();
    out_one.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // Channel 2 is unaffected.
    let mut in_two = File::from(a_two.input);
    let mut out_two = File::from(b_two.output);
    in_two.write_all(b"still here").unwrap();
    assert_eq!(read_bytes(&mut out_two, 10), b"still here");

    shutdown_pair(a, b);
}

#[test]
fn large_transfers_cross_frame_boundaries() {
    let (a, b) = mixer_pair();

    let a_side = a.add_slave(Some(1)).unwrap();
    let b_side = b.add_slave(Some(1)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut a_input = File::from(a_side.input);
    let writer = thread::spawn(move || {
        a_input.write_all(&payload).unwrap();
    });

    let mut b_output = File::from(b_side.output);
    let received = read_bytes(&mut b_output, expected.len());
    assert_eq!(received, expected);

    writer.join().unwrap();
    shutdown_pair(a, b);
}

#[test]
fn compressed_frames_shrink_on_the_wire() {
    let (side_a, mut raw_peer) = pipe::pipe().unwrap();
    let a = socket_mixer(side_a);
    a.set_compressor(ZlibCodec::new());

    let a_side = a.add_slave(Some(3)).unwrap();
    a.set_slave_compression(3, true).unwrap();

    let mut a_input = File::from(a_side.input);
    a_input.write_all(&[0u8; 4096]).unwrap();

    // One frame, compressed flag set, declared length strictly below the
    // original size.
    let (id, flags, length) = read_frame_header(&mut raw_peer);
    assert_eq!(id, 3);
    assert_eq!(flags & FLAG_COMPRESSED, FLAG_COMPRESSED);
    assert!(length > 0);
    assert!((length as usize) < 4096);

    let mut wire = vec![0u8; length as usize];
    raw_peer.read_exact(&mut wire).unwrap();

    let mut decoded = vec![0xFFu8; 8192];
    let n = ZlibCodec::new().uncompress(&wire, &mut decoded).unwrap();
    assert_eq!(n, 4096);
    assert!(decoded[..n].iter().all(|byte| *byte == 0));

    // Exactly one data frame: teardown follows immediately with the
    // channel EOF and then the master EOF.
    drop(a_input);
    drop(a);

    assert_eq!(read_frame_header(&mut raw_peer), (3, 0, 0));
    assert_eq!(read_frame_header(&mut raw_peer), (0, 0, 0));
}

#[test]
fn small_payloads_travel_raw() {
    let (side_a, mut raw_peer) = pipe::pipe().unwrap();
    let a = socket_mixer(side_a);
    a.set_compressor(ZlibCodec::new());

    let a_side = a.add_slave(Some(1)).unwrap();
    a.set_slave_compression(1, true).unwrap();

    let mut a_input = File::from(a_side.input);
    a_input.write_all(b"under the threshold").unwrap();

    let (id, flags, length) = read_frame_header(&mut raw_peer);
    assert_eq!(id, 1);
    assert_eq!(flags & FLAG_COMPRESSED, 0);
    assert_eq!(length as usize, "under the threshold".len());

    let mut wire = vec![0u8; length as usize];
    raw_peer.read_exact(&mut wire).unwrap();
    assert_eq!(wire, b"under the threshold");
}

#[test]
fn compressed_round_trip_between_mixers() {
    let (a, b) = mixer_pair();
    a.set_compressor(ZlibCodec::new());
    b.set_compressor(ZlibCodec::new());

    let a_side = a.add_slave(Some(1)).unwrap();
    let b_side = b.add_slave(Some(1)).unwrap();
    a.set_slave_compression(1, true).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let payload: Vec<u8> = (0..4096usize).map(|i| (i / 64) as u8).collect();
    let expected = payload.clone();

    let mut a_input = File::from(a_side.input);
    a_input.write_all(&payload).unwrap();

    let mut b_output = File::from(b_side.output);
    assert_eq!(read_bytes(&mut b_output, expected.len()), expected);

    shutdown_pair(a, b);
}

#[test]
fn cancelled_reads_emit_no_frames() {
    let (side_a, mut raw_peer) = pipe::pipe().unwrap();
    let a = socket_mixer(side_a);

    // The encoder sits blocked on an empty pipe; removal cancels that read.
    let endpoints = a.add_slave(Some(1)).unwrap();
    a.remove_slave(1).unwrap();
    drop(endpoints);

    // Nothing was emitted for channel 1, not even an EOF: the first bytes on
    // the wire are the teardown's master EOF.
    drop(a);
    assert_eq!(read_frame_header(&mut raw_peer), (0, 0, 0));
}

#[test]
fn compression_requires_a_codec() {
    let (a, _b) = mixer_pair();
    a.add_slave(Some(1)).unwrap();

    assert!(matches!(
        a.set_slave_compression(1, true),
        Err(Error::Channel(ChannelError::CompressorMissing))
    ));

    // Toggling off is always allowed.
    a.set_slave_compression(1, false).unwrap();
}

#[test]
fn auto_ids_are_the_smallest_free_positive() {
    let (a, _b) = mixer_pair();

    assert_eq!(a.add_slave(None).unwrap().id, 1);
    assert_eq!(a.add_slave(None).unwrap().id, 2);
    assert_eq!(a.add_slave(Some(5)).unwrap().id, 5);
    assert_eq!(a.add_slave(None).unwrap().id, 3);

    a.remove_slave(2).unwrap();
    assert_eq!(a.add_slave(None).unwrap().id, 2);

    // Explicit ids must be unique and positive; 0 is the transport's.
    assert!(matches!(
        a.add_slave(Some(5)),
        Err(Error::Channel(ChannelError::DuplicateId(5)))
    ));
    assert!(matches!(
        a.add_slave(Some(0)),
        Err(Error::Channel(ChannelError::ReservedId))
    ));

    // Removing an unregistered id is a successful no-op.
    a.remove_slave(99).unwrap();
}

#[test]
fn graceful_shutdown_handshake() {
    let (a, b) = mixer_pair();

    a.add_slave(Some(1)).unwrap();
    b.add_slave(Some(1)).unwrap();

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    b.set_slave_dead_callback(move |id| recorder.lock().unwrap().push(id));

    a.start().unwrap();
    b.start().unwrap();

    let remote = thread::spawn(move || {
        a.shutdown().unwrap();
        a.join();
    });

    // B observes the channel-0 EOF within the bounded interval.
    let deadline = Instant::now() + Duration::from_secs(3);
    while !seen.lock().unwrap().contains(&0) {
        assert!(Instant::now() < deadline, "no master EOF observed");
        thread::sleep(Duration::from_millis(10));
    }

    b.shutdown().unwrap();
    b.join();
    remote.join().unwrap();

    // The decoder's death was reported exactly once.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.iter().filter(|id| **id == 0).count(), 1);
    assert_eq!(seen.iter().filter(|id| **id == 1).count(), 1);
}

#[test]
fn shutdown_is_idempotent() {
    let (a, b) = mixer_pair();
    a.add_slave(Some(1)).unwrap();
    a.start().unwrap();

    let remote = thread::spawn(move || {
        b.shutdown().unwrap();
        b.join();
    });

    a.shutdown().unwrap();
    a.shutdown().unwrap();
    a.join();
    remote.join().unwrap();
}

#[test]
fn broken_connection_reports_channel_zero() {
    let (side_b, raw_peer) = pipe::pipe().unwrap();
    let b = socket_mixer(side_b);
    b.set_quiet_mode(true);

    b.add_slave(Some(1)).unwrap();

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    b.set_slave_dead_callback(move |id| recorder.lock().unwrap().push(id));

    b.start().unwrap();

    // Kill the transport underneath the mixer, no handshake.
    drop(raw_peer);

    b.join();
    assert!(seen.lock().unwrap().contains(&0));
}

#[test]
fn oversize_frames_break_the_connection() {
    let (side_b, mut raw_peer) = pipe::pipe().unwrap();
    let b = socket_mixer(side_b);
    b.set_quiet_mode(true);
    b.add_slave(Some(1)).unwrap();

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    b.set_slave_dead_callback(move |id| recorder.lock().unwrap().push(id));

    b.start().unwrap();

    let mut head = Vec::new();
    head.extend_from_slice(&1i32.to_le_bytes());
    head.push(0);
    head.extend_from_slice(&((MAX_FRAME as i32) + 1).to_le_bytes());
    raw_peer.write_all(&head).unwrap();

    b.join();
    assert!(seen.lock().unwrap().contains(&0));
}

#[test]
fn shutdown_from_slave_dead_callback_is_refused() {
    let (side_b, raw_peer) = pipe::pipe().unwrap();
    let b = Arc::new(socket_mixer(side_b));
    b.set_quiet_mode(true);
    b.add_slave(Some(1)).unwrap();

    let refused = Arc::new(AtomicBool::new(false));

    let callback_mixer = Arc::clone(&b);
    let callback_refused = Arc::clone(&refused);
    b.set_slave_dead_callback(move |id| {
        if id == 0 {
            match callback_mixer.shutdown() {
                Err(Error::Channel(ChannelError::ReentrantShutdown)) => {
                    callback_refused.store(true, Ordering::Release);
                }
                other => panic!("reentrant shutdown not refused: {other:?}"),
            }
        }
    });

    b.start().unwrap();
    drop(raw_peer);
    b.join();

    assert!(refused.load(Ordering::Acquire));

    // Break the callback's cycle back to the mixer before dropping it.
    b.set_slave_dead_callback(|_| {});
    b.shutdown().unwrap();
}

/// An in-memory duplex link: a fifo for the bytes, a semaphore to wake the
/// reader, a closed flag for cancellation. Exercises the callback-transport
/// constructor without any OS descriptor.
struct FifoLink {
    fifo: Fifo,
    ready: Semaphore,
    closed: AtomicBool,
}

impl FifoLink {
    fn new(name: &str) -> Arc<FifoLink> {
        Arc::new(FifoLink {
            fifo: Fifo::new(1 << 20),
            ready: Semaphore::new(0, name),
            closed: AtomicBool::new(false),
        })
    }

    fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }

        self.fifo
            .push(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.ready.signal();
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.ready.wait(None).is_err() {
                return Ok(0);
            }

            if self.closed.load(Ordering::Acquire) && self.fifo.is_empty() {
                return Ok(0);
            }

            let mut guard = self.fifo.lock();
            let n = guard.len().min(buf.len());
            if n == 0 {
                continue;
            }

            guard.pop(&mut buf[..n]).unwrap();
            if !guard.is_empty() {
                self.ready.signal();
            }
            return Ok(n);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.signal();
    }
}

fn fifo_mixer(rx: Arc<FifoLink>, tx: Arc<FifoLink>) -> IoMixer {
    let reader = Arc::clone(&rx);
    let writer = Arc::clone(&tx);

    IoMixer::with_callbacks(
        Box::new(move |buf| reader.recv(buf)),
        Box::new(move |buf| writer.send(buf)),
        Some(Box::new(move || {
            rx.close();
            tx.close();
        })),
    )
}

#[test]
fn callback_transport_round_trip() {
    let a_to_b = FifoLink::new("a->b");
    let b_to_a = FifoLink::new("b->a");

    let a = fifo_mixer(Arc::clone(&b_to_a), Arc::clone(&a_to_b));
    let b = fifo_mixer(a_to_b, b_to_a);

    let a_side = a.add_slave(Some(1)).unwrap();
    let b_side = b.add_slave(Some(1)).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let mut a_input = File::from(a_side.input);
    a_input.write_all(b"over fifos").unwrap();

    let mut b_output = File::from(b_side.output);
    assert_eq!(read_bytes(&mut b_output, 10), b"over fifos");

    shutdown_pair(a, b);
}
