//! Parses `.torrent` metainfo files and exposes piece/file geometry.
//!
//! A bencoded `.torrent` file is decoded into [`Metainfo`], from which the
//! info hash, piece hashes, and file layout are derived once and treated as
//! immutable for the remainder of the run.

use std::path::{Path, PathBuf};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::error::MetainfoError;
use crate::{PeerId, PieceIndex, Sha1Hash};

/// The fixed BitTorrent protocol string sent in every handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Whether a torrent describes a single file or an archive of several
/// files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Single,
    Multi,
}

/// One file entry in a torrent, with its length and path relative to the
/// download directory.
///
/// For single-file torrents there is exactly one synthetic entry, using
/// [`Metainfo::name`] as the path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetainfoFile {
    pub path: PathBuf,
    pub length: u64,
}

/// The parsed, validated contents of a `.torrent` file.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// SHA-1 of the bencoded `info` dictionary, identifying the swarm.
    pub info_hash: Sha1Hash,
    /// The torrent's name (used as the single output file's name, or as the
    /// archive's root directory name).
    pub name: String,
    /// The nominal length of a piece, in bytes.
    pub piece_length: u32,
    /// One 20-byte SHA-1 digest per piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The sum of the length of all files in the torrent.
    pub total_length: u64,
    /// Whether this torrent is single- or multi-file.
    pub mode: Mode,
    /// The ordered file table (see [`MetainfoFile`]).
    pub files: Vec<MetainfoFile>,
    /// For each file, its one-past-the-last byte offset in the torrent,
    /// expressed as `(piece_index, byte_offset_within_piece)`.
    pub file_offsets: Vec<(PieceIndex, u32)>,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    /// Reads and parses a `.torrent` file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let buf = std::fs::read(path)?;
        Self::from_bytes(&buf)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self, MetainfoError> {
        let RawMetainfo { announce, info } = raw;

        // The info-hash must be the SHA-1 of the exact bencode-canonical
        // byte sequence of the `info` dictionary, which we get by
        // re-encoding the decoded value with the same bencode library that
        // decoded it.
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&digest);

        let piece_length: u32 = info
            .piece_length
            .try_into()
            .map_err(|_| MetainfoError::MissingField("info.piece length"))?;
        if piece_length == 0 {
            return Err(MetainfoError::MissingField("info.piece length"));
        }

        let pieces = info.pieces.into_vec();
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieceHashLength(pieces.len()));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (mode, files, total_length) = match info.files {
            Some(raw_files) => {
                let mut files = Vec::with_capacity(raw_files.len());
                let mut total = 0u64;
                for f in raw_files {
                    let length: u64 = f
                        .length
                        .try_into()
                        .map_err(|_| MetainfoError::MissingField("files[].length"))?;
                    total += length;
                    files.push(MetainfoFile {
                        path: f.path.iter().collect(),
                        length,
                    });
                }
                (Mode::Multi, files, total)
            }
            None => {
                let length = info
                    .length
                    .ok_or(MetainfoError::MissingField("info.length"))?;
                (
                    Mode::Single,
                    vec![MetainfoFile {
                        path: PathBuf::from(&info.name),
                        length,
                    }],
                    length,
                )
            }
        };

        let piece_count = piece_hashes.len();
        if piece_count == 0 {
            return Err(MetainfoError::MissingField("info.pieces"));
        }
        // total_length must be coverable by piece_count whole pieces, with
        // the last piece possibly shorter.
        let expected_piece_count = (total_length as f64 / piece_length as f64).ceil() as usize;
        if expected_piece_count != piece_count {
            return Err(MetainfoError::LengthMismatch {
                expected: piece_length as u64 * piece_count as u64,
                actual: total_length,
            });
        }

        let file_offsets = compute_file_offsets(&files, piece_length);

        Ok(Self {
            announce,
            info_hash,
            name: info.name,
            piece_length,
            piece_hashes,
            total_length,
            mode,
            files,
            file_offsets,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of the last piece, which may be shorter than
    /// [`Metainfo::piece_length`] if `total_length` isn't an exact multiple
    /// of it.
    pub fn last_piece_length(&self) -> u32 {
        let full_pieces = (self.piece_count() - 1) as u64;
        let remainder = self.total_length - self.piece_length as u64 * full_pieces;
        remainder as u32
    }

    /// The length of the piece at `index`.
    pub fn piece_length_at(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count() {
            Some(self.last_piece_length())
        } else if index < self.piece_count() {
            Some(self.piece_length)
        } else {
            None
        }
    }

    /// Builds the handshake this client sends, and the template used to
    /// validate a peer's handshake.
    pub fn handshake(&self, peer_id: PeerId) -> Handshake {
        Handshake::new(self.info_hash, peer_id)
    }
}

/// Computes, for each file, the `(piece_index, byte_offset_within_piece)` of
/// its one-past-the-last byte in the whole-torrent byte stream.
fn compute_file_offsets(files: &[MetainfoFile], piece_length: u32) -> Vec<(PieceIndex, u32)> {
    let mut cumulative: u64 = 0;
    let mut offsets = Vec::with_capacity(files.len());
    for file in files {
        cumulative += file.length;
        let piece_index = (cumulative / piece_length as u64) as PieceIndex;
        let byte_offset = (cumulative % piece_length as u64) as u32;
        offsets.push((piece_index, byte_offset));
    }
    offsets
}

/// The 68-byte BitTorrent handshake: `0x13 | "BitTorrent protocol" |
/// 8x0x00 | info_hash | peer_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub pstrlen: u8,
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LEN: usize = 49 + PROTOCOL_STRING.len();

    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            pstrlen: PROTOCOL_STRING.len() as u8,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.pstrlen;
        buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a 68-byte buffer into a handshake, without validating its
    /// contents against an expected info hash — that's left to the caller
    /// (the peer session, which knows which swarm it's connecting to).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        let pstrlen = buf[0];
        if pstrlen as usize != PROTOCOL_STRING.len() {
            return None;
        }
        if &buf[1..20] != PROTOCOL_STRING.as_bytes() {
            return None;
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Some(Self {
            pstrlen,
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMetainfo {
    announce: String,
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_raw(raw: &RawMetainfo) -> Vec<u8> {
        serde_bencode::to_bytes(raw).expect("test fixture must encode")
    }

    fn piece_hashes_bytes(count: usize) -> ByteBuf {
        let mut bytes = Vec::with_capacity(count * 20);
        for i in 0..count {
            bytes.extend(std::iter::repeat(i as u8).take(20));
        }
        ByteBuf::from(bytes)
    }

    #[test]
    fn test_from_bytes_single_file() {
        let raw = RawMetainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "movie.mkv".to_string(),
                pieces: piece_hashes_bytes(3),
                piece_length: 16,
                length: Some(2 * 16 + 5),
                files: None,
                private: None,
            },
        };
        let encoded = encode_raw(&raw);

        let metainfo = Metainfo::from_bytes(&encoded).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.example.com/announce");
        assert_eq!(metainfo.mode, Mode::Single);
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.piece_hashes.len(), metainfo.piece_count());
        assert_eq!(metainfo.total_length, 2 * 16 + 5);
        assert_eq!(
            metainfo.files.iter().map(|f| f.length).sum::<u64>(),
            metainfo.total_length
        );
        assert_eq!(metainfo.last_piece_length(), 5);
        assert_eq!(metainfo.files, vec![MetainfoFile {
            path: PathBuf::from("movie.mkv"),
            length: 2 * 16 + 5,
        }]);
    }

    #[test]
    fn test_from_bytes_multi_file() {
        let raw = RawMetainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "archive".to_string(),
                pieces: piece_hashes_bytes(2),
                piece_length: 16,
                length: None,
                files: Some(vec![
                    RawFile { path: vec!["a.txt".to_string()], length: 10 },
                    RawFile { path: vec!["sub".to_string(), "b.txt".to_string()], length: 22 },
                ]),
                private: None,
            },
        };
        let encoded = encode_raw(&raw);

        let metainfo = Metainfo::from_bytes(&encoded).unwrap();
        assert_eq!(metainfo.mode, Mode::Multi);
        assert_eq!(metainfo.total_length, 32);
        assert_eq!(
            metainfo.files.iter().map(|f| f.length).sum::<u64>(),
            metainfo.total_length
        );
        assert_eq!(metainfo.files[1].path, PathBuf::from("sub/b.txt"));
    }

    #[test]
    fn test_from_bytes_rejects_piece_hash_length_not_multiple_of_20() {
        let raw = RawMetainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "bad".to_string(),
                pieces: ByteBuf::from(vec![0u8; 25]),
                piece_length: 16,
                length: Some(16),
                files: None,
                private: None,
            },
        };
        let encoded = encode_raw(&raw);

        let err = Metainfo::from_bytes(&encoded).unwrap_err();
        assert!(matches!(err, MetainfoError::InvalidPieceHashLength(25)));
    }

    #[test]
    fn test_from_bytes_rejects_length_mismatch() {
        let raw = RawMetainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "bad".to_string(),
                pieces: piece_hashes_bytes(1),
                piece_length: 16,
                // Declares a length that doesn't fit in exactly 1 piece.
                length: Some(100),
                files: None,
                private: None,
            },
        };
        let encoded = encode_raw(&raw);

        let err = Metainfo::from_bytes(&encoded).unwrap_err();
        assert!(matches!(err, MetainfoError::LengthMismatch { .. }));
    }

    #[test]
    fn test_info_hash_is_deterministic_function_of_info_dict() {
        let raw_a = RawMetainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "same".to_string(),
                pieces: piece_hashes_bytes(1),
                piece_length: 16,
                length: Some(16),
                files: None,
                private: None,
            },
        };
        // A different announce URL shouldn't change the info hash, since the
        // hash only covers the `info` sub-dictionary.
        let raw_b = RawMetainfo {
            announce: "http://other-tracker.example.com/announce".to_string(),
            info: RawInfo {
                name: "same".to_string(),
                pieces: piece_hashes_bytes(1),
                piece_length: 16,
                length: Some(16),
                files: None,
                private: None,
            },
        };

        let a = Metainfo::from_bytes(&encode_raw(&raw_a)).unwrap();
        let b = Metainfo::from_bytes(&encode_raw(&raw_b)).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn test_handshake_round_trip() {
        let info_hash: Sha1Hash = [
            0xA7, 0x80, 0x28, 0x3D, 0x38, 0xF1, 0x40, 0xE4, 0x06, 0x5B, 0x25, 0xCA, 0xE9, 0x19,
            0x5E, 0x09, 0xD0, 0x13, 0x5F, 0xC5,
        ];
        let peer_id: PeerId = *b"08351903611630915380";
        let handshake = Handshake::new(info_hash, peer_id);
        let encoded = handshake.encode();

        let mut expected = vec![0x13u8];
        expected.extend_from_slice(PROTOCOL_STRING.as_bytes());
        expected.extend_from_slice(&[0u8; 8]);
        expected.extend_from_slice(&info_hash);
        expected.extend_from_slice(&peer_id);

        assert_eq!(encoded.to_vec(), expected);
        assert_eq!(Handshake::decode(&encoded).unwrap(), handshake);
    }

    #[test]
    fn test_handshake_decode_rejects_wrong_length() {
        assert!(Handshake::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_file_offsets_single_file() {
        let files = vec![MetainfoFile {
            path: PathBuf::from("a"),
            length: 40,
        }];
        let offsets = compute_file_offsets(&files, 16);
        // byte 40 falls in piece index 2 (bytes 32..48), at offset 8
        assert_eq!(offsets, vec![(2, 8)]);
    }

    #[test]
    fn test_file_offsets_multi_file() {
        let files = vec![
            MetainfoFile {
                path: PathBuf::from("a"),
                length: 9,
            },
            MetainfoFile {
                path: PathBuf::from("b"),
                length: 11,
            },
            MetainfoFile {
                path: PathBuf::from("c"),
                length: 7,
            },
        ];
        let offsets = compute_file_offsets(&files, 16);
        // cumulative ends: 9, 20, 27
        assert_eq!(offsets, vec![(0, 9), (1, 4), (1, 11)]);
    }
}
