//! Crate-wide error types.
//!
//! Each component exposes its own narrow error type (`MetainfoError`,
//! `TrackerError`, ...), and this module aggregates them behind a single
//! `Error` so callers at the engine/CLI boundary have one type to match on.
//! Dispositions (fatal at startup vs. per-peer) are documented on each
//! variant.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `Metainfo::from_bytes`/`from_path`.
///
/// Fatal at startup: the process exits without contacting any tracker or
/// peer.
#[derive(Debug)]
#[non_exhaustive]
pub enum MetainfoError {
    /// The bencoded metainfo could not be parsed at all.
    Bencode(serde_bencode::Error),
    /// A required key was absent from the `info` dictionary.
    MissingField(&'static str),
    /// `pieces` length is not a multiple of 20.
    InvalidPieceHashLength(usize),
    /// The sum of file lengths doesn't match the declared torrent length.
    LengthMismatch { expected: u64, actual: u64 },
    /// Failed to read the torrent file from disk.
    Io(io::Error),
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "invalid bencode: {}", e),
            Self::MissingField(field) => {
                write!(f, "metainfo missing required field: {}", field)
            }
            Self::InvalidPieceHashLength(len) => write!(
                f,
                "piece hash string length {} is not a multiple of 20",
                len
            ),
            Self::LengthMismatch { expected, actual } => write!(
                f,
                "sum of file lengths {} does not match declared torrent length {}",
                actual, expected
            ),
            Self::Io(e) => write!(f, "failed to read torrent file: {}", e),
        }
    }
}

impl std::error::Error for MetainfoError {}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<io::Error> for MetainfoError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors returned by the tracker client.
///
/// Fatal at startup: without a peer list there is nothing to download.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The announce URL scheme was neither `http` nor `https`.
    UnsupportedTracker(String),
    /// The HTTP request itself failed, or the tracker returned an error
    /// status.
    Http(reqwest::Error),
    /// The tracker's response body could not be parsed as bencode.
    Bencode(serde_bencode::Error),
    /// The `peers` byte string length was not a multiple of 6.
    MalformedPeers(usize),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedTracker(scheme) => {
                write!(f, "unsupported tracker scheme: {}", scheme)
            }
            Self::Http(e) => write!(f, "tracker unreachable: {}", e),
            Self::Bencode(e) => write!(f, "invalid tracker response: {}", e),
            Self::MalformedPeers(len) => write!(
                f,
                "compact peers string length {} is not a multiple of 6",
                len
            ),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

/// Errors raised while decoding a peer wire message.
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecError {
    /// The message ID byte did not match any known message.
    UnknownMessageId(u8),
    /// The frame's declared length doesn't match what its message type
    /// requires (e.g. a `request` frame that isn't exactly 13 bytes).
    InvalidFrameLength { message_id: u8, len: u32 },
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMessageId(id) => write!(f, "unknown message id: {}", id),
            Self::InvalidFrameLength { message_id, len } => write!(
                f,
                "invalid frame length {} for message id {}",
                len, message_id
            ),
            Self::Io(e) => write!(f, "io error while decoding frame: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Per-peer errors. Disposition: close the offending connection and
/// continue with other peers; never fatal to the whole run.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The peer's handshake didn't match our info hash or had the wrong
    /// length.
    HandshakeInvalid,
    /// A message was sent in a state that doesn't accept it, or a frame
    /// could not be decoded.
    ProtocolViolation(String),
    /// A fully assembled piece didn't hash to the expected value.
    PieceHashMismatch(crate::PieceIndex),
    Codec(CodecError),
    /// The underlying TCP connection failed.
    Io(io::Error),
    /// Persisting a verified piece to disk failed. Unlike the other
    /// variants this is fatal to the whole run, not just to this peer.
    DiskIo(io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeInvalid => write!(f, "peer handshake invalid"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            Self::PieceHashMismatch(index) => {
                write!(f, "piece {} failed hash verification", index)
            }
            Self::Codec(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "peer io error: {}", e),
            Self::DiskIo(e) => write!(f, "failed to persist piece to disk: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for PeerError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// The top-level error type, returned by `engine::run` and the CLI.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Metainfo(MetainfoError),
    Tracker(TrackerError),
    /// Writing a verified piece, or reassembling the final output files,
    /// failed. Always fatal.
    Io(io::Error),
    /// The requested piece or file index was out of range for this
    /// torrent.
    InvalidIndex,
    /// Every peer disconnected before the torrent finished downloading.
    Incomplete { downloaded: usize, total: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metainfo(e) => write!(f, "{}", e),
            Self::Tracker(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "{}", e),
            Self::InvalidIndex => write!(f, "piece or file index out of range"),
            Self::Incomplete { downloaded, total } => write!(
                f,
                "swarm exhausted with {}/{} pieces downloaded",
                downloaded, total
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<MetainfoError> for Error {
    fn from(e: MetainfoError) -> Self {
        Self::Metainfo(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
