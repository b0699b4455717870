// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bridge stdin/stdout to one channel of a mixer running over TCP.
//!
//! Two muxcat processes pointed at each other behave like a bidirectional
//! netcat, except the traffic travels framed and (optionally) compressed,
//! and either side can hang up cleanly.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use log::*;

use mux_protocol::mixer::{EndpointType, IoMixer, ZlibCodec};

/// Sent on the event channel when the bridged channel drained to EOF.
const CHANNEL_DRAINED: i32 = -1;

#[derive(Parser)]
struct Cli {
    /// Accept one inbound connection on this address.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Connect out to this address.
    #[arg(long)]
    connect: Option<String>,

    /// Channel id to bridge.
    #[arg(long, default_value_t = 1)]
    channel: i32,

    /// Compress the channel's payloads.
    #[arg(long)]
    compress: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();

    let stream = match (&args.listen, &args.connect) {
        (Some(address), _) => {
            let listener = TcpListener::bind(address)?;
            info!("listening on {address}");
            let (stream, peer) = listener.accept()?;
            info!("accepted connection from {peer}");
            stream
        }
        (None, Some(address)) => {
            let stream = TcpStream::connect(address)?;
            info!("connected to {address}");
            stream
        }
        (None, None) => {
            eprintln!("either --listen or --connect is required");
            std::process::exit(2);
        }
    };

    // Writing into a hung-up channel should surface as an error, not kill
    // the process.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )?;
    }

    let master_in: OwnedFd = stream.try_clone()?.into();
    let master_out: OwnedFd = stream.into();

    let mixer = IoMixer::new(
        master_in,
        master_out,
        EndpointType::Socket,
        EndpointType::Socket,
    );
    mixer.set_compressor(ZlibCodec::new());
    mixer.set_quiet_mode(true);

    let (events_tx, events_rx) = mpsc::channel::<i32>();

    let dead_tx = events_tx.clone();
    mixer.set_slave_dead_callback(move |id| {
        let _ = dead_tx.send(id);
    });

    let endpoints = mixer.add_slave(Some(args.channel))?;
    if args.compress {
        mixer.set_slave_compression(args.channel, true)?;
    }

    mixer.start()?;

    let mut to_mixer = File::from(endpoints.input);
    let mut from_mixer = File::from(endpoints.output);

    // stdin -> channel. Dropping the descriptor on stdin EOF is what sends
    // the channel's EOF frame to the peer. Left detached: a tty that never
    // closes stdin should not hold up the exit once the peer hangs up.
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        match io::copy(&mut stdin, &mut to_mixer) {
            Ok(bytes) => debug!("stdin closed after {bytes} bytes"),
            Err(e) => warn!("stdin copy failed: {e}"),
        }
    });

    // channel -> stdout. Also detached; shutdown unblocks it by closing the
    // channel's pipes.
    thread::spawn(move || {
        let mut stdout = io::stdout().lock();
        let mut buf = [0u8; 8192];
        loop {
            match from_mixer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).and_then(|_| stdout.flush()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("channel read failed: {e}");
                    break;
                }
            }
        }
        let _ = events_tx.send(CHANNEL_DRAINED);
    });

    // Wait for the peer's channel EOF to drain through, or for the decoder
    // to die underneath us (peer hangup without a handshake).
    loop {
        match events_rx.recv() {
            Ok(CHANNEL_DRAINED) => {
                info!("peer closed the channel, shutting down");
                break;
            }
            Ok(0) => {
                info!("transport closed, shutting down");
                break;
            }
            Ok(id) => debug!("channel {id} finished"),
            Err(_) => break,
        }
    }

    mixer.shutdown()?;
    mixer.join();

    Ok(())
}
