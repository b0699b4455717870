// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Carry many isolated byte channels over one full-duplex transport.
//!
//! The heart of the crate is [`mixer::IoMixer`], which frames each channel's
//! bytes into `<id><flags><length><payload>` records on a shared "master"
//! stream and splits the reverse direction back out. The rest is support:
//! the wire codec lives here in the crate root, [`fifo`] is a cyclic byte
//! buffer, and [`pipe`] builds socketpair loopbacks for tests and tools.

pub mod fifo;
pub mod mixer;
pub mod pipe;

use std::fmt;

/// Longest payload carried by a single frame. A decoder treats any declared
/// length above this as a broken connection.
pub const MAX_FRAME: usize = 64 * 1024;

/// Payloads at or below this many bytes are never worth compressing and are
/// always sent raw.
pub const COMPRESS_THRESHOLD: usize = 256;

/// `<channelId: i32 LE> <flags: u8> <length: i32 LE>`.
pub const FRAME_HEADER_LEN: usize = 9;

/// Frame flag bit 0: the payload is compressed. Bits 1-7 are reserved,
/// transmitted as zero and ignored on receive.
pub const FLAG_COMPRESSED: u8 = 1 << 0;

/// The possible errors that can arise from driving a mixer.
#[derive(Debug)]
pub enum Error {
    /// Wire-level failures. These break the whole transport: the decoder
    /// treats them as a lost connection.
    Protocol(ProtocolError),

    /// Channel bookkeeping failures: bad ids, operations after shutdown,
    /// missing compressor. These are caller errors and leave the mixer in a
    /// consistent state.
    Channel(ChannelError),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Channel(e) => write!(f, "Channel error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame declared a negative length or one above [`MAX_FRAME`].
    Oversize(i32),

    /// A compressed frame arrived but no compressor is configured.
    CompressedWithoutCodec,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize(len) => write!(f, "frame length {len} exceeds the per-frame ceiling"),
            Self::CompressedWithoutCodec => {
                write!(f, "compressed frame received but no compressor is loaded")
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel id 0 is reserved for the transport itself.
    ReservedId,

    /// The id is already registered on this mixer.
    DuplicateId(i32),

    /// No slave with that id exists.
    UnknownId(i32),

    /// The mixer has been shut down.
    MixerDead,

    /// Compression was requested but no compressor is configured.
    CompressorMissing,

    /// `shutdown` was called from inside a slave-dead callback of the same
    /// mixer, which would self-join the calling thread.
    ReentrantShutdown,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedId => write!(f, "channel id 0 is reserved for the transport"),
            Self::DuplicateId(id) => write!(f, "channel id {id} is not unique"),
            Self::UnknownId(id) => write!(f, "channel id {id} does not exist"),
            Self::MixerDead => write!(f, "mixer is already shut down"),
            Self::CompressorMissing => write!(f, "no compressor loaded"),
            Self::ReentrantShutdown => {
                write!(f, "shutdown called from a slave-dead callback of this mixer")
            }
        }
    }
}

/// Append a frame header for `length` payload bytes on channel `id`.
pub(crate) fn encode_frame_header(buf: &mut Vec<u8>, id: i32, flags: u8, length: i32) {
    buf.extend_from_slice(&id.to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(&length.to_le_bytes());
}

/// Split a frame header into `(channel id, flags, declared length)`.
/// `head` must hold exactly [`FRAME_HEADER_LEN`] bytes.
pub(crate) fn decode_frame_header(head: &[u8]) -> (i32, u8, i32) {
    let id = i32::from_le_bytes(head[0..4].try_into().unwrap());
    let flags = head[4];
    let length = i32::from_le_bytes(head[5..9].try_into().unwrap());

    (id, flags, length)
}
