//! Persists verified pieces to disk and reassembles them into the
//! torrent's output files.
//!
//! Unlike a streaming writer that seeks into live output files as blocks
//! arrive, this writer treats a verified piece as an opaque blob: each
//! piece is written whole to `<piece_dir>/<index>.piece`, and only once
//! every piece has arrived does [`FileWriter::write_files`] stitch the
//! blobs into the torrent's declared files. This trades a little disk
//! space for the ability to resume a crashed download by simply rescanning
//! which piece files already exist.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage_info::{FsStructure, StorageInfo};
use crate::PieceIndex;

/// Lower-cases and strips non-alphanumeric characters from a torrent's
/// declared name, to get a filesystem-safe directory name.
pub fn sanitize_dir_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Writes downloaded pieces to disk and reassembles them into the
/// torrent's final output files.
pub struct FileWriter {
    /// `<torrent_dir>/piece_dir`, holding one `<index>.piece` file per
    /// downloaded piece until reassembly.
    piece_dir: PathBuf,
    /// `<torrent_dir>/files`, the final destination of the reassembled
    /// output files.
    files_dir: PathBuf,
    storage: StorageInfo,
}

impl FileWriter {
    /// Creates the torrent's directory layout (idempotently: existing
    /// piece files are left alone so a previous run can be resumed).
    pub fn new(download_dir: impl Into<PathBuf>, torrent_name: &str, storage: StorageInfo) -> Result<Self> {
        let torrent_dir = download_dir.into().join(sanitize_dir_name(torrent_name));
        let piece_dir = torrent_dir.join("piece_dir");
        let files_dir = torrent_dir.join("files");
        fs::create_dir_all(&piece_dir)?;
        fs::create_dir_all(&files_dir)?;
        Ok(Self {
            piece_dir,
            files_dir,
            storage,
        })
    }

    /// Scans the piece directory and returns the indices of pieces already
    /// downloaded, trusted without re-validation: a crash-recovery scan,
    /// not a checksum re-verify.
    pub fn curr_pieces(&self) -> Result<HashSet<PieceIndex>> {
        let mut indices = HashSet::new();
        if !self.piece_dir.exists() {
            return Ok(indices);
        }
        for entry in fs::read_dir(&self.piece_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("piece") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(index) = stem.parse::<PieceIndex>() {
                    indices.insert(index);
                }
            }
        }
        Ok(indices)
    }

    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.piece_dir.join(format!("{}.piece", index))
    }

    /// Writes a fully verified piece's bytes to its blob file.
    pub fn write_piece(&self, index: PieceIndex, bytes: &[u8]) -> Result<()> {
        let path = self.piece_path(index);
        log::debug!("writing piece {} ({} bytes) to {:?}", index, bytes.len(), path);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Reassembles every piece blob into the torrent's declared output
    /// files under `files_dir`.
    ///
    /// Requires every piece to be present; call only once the piece queue
    /// (minus whatever was already on disk) has been fully drained.
    pub fn write_files(&self) -> Result<()> {
        match &self.storage.structure {
            FsStructure::File(file) => {
                let dest = self.files_dir.join(&file.path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.stitch_single_file(&dest, file.len)?;
            }
            FsStructure::Archive { files } => {
                for file in files {
                    let dest = self.files_dir.join(&file.path);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    self.stitch_file_range(&dest, file.torrent_offset, file.len)?;
                }
            }
        }
        Ok(())
    }

    /// Concatenates every piece into a single output file of exactly
    /// `expected_len` bytes.
    fn stitch_single_file(&self, dest: &Path, expected_len: u64) -> Result<()> {
        let mut out = File::create(dest)?;
        let mut written = 0u64;
        for index in 0..self.storage.piece_count {
            let mut piece = File::open(self.piece_path(index))?;
            written += std::io::copy(&mut piece, &mut out)?;
        }
        if written != expected_len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "reassembled {} bytes, expected exactly {}",
                    written, expected_len
                ),
            )));
        }
        Ok(())
    }

    /// Writes the byte range `[torrent_offset, torrent_offset + len)` of
    /// the whole-torrent byte stream into `dest`, pulling the relevant
    /// bytes out of whichever piece blobs intersect it.
    fn stitch_file_range(&self, dest: &Path, torrent_offset: u64, len: u64) -> Result<()> {
        let mut out = File::create(dest)?;
        let mut remaining = len;
        let mut offset = torrent_offset;
        let mut written = 0u64;

        while remaining > 0 {
            let piece_len = self.storage.piece_len as u64;
            let piece_index = (offset / piece_len) as PieceIndex;
            let offset_in_piece = offset % piece_len;

            let mut piece_file = File::open(self.piece_path(piece_index))?;
            piece_file.seek(SeekFrom::Start(offset_in_piece))?;

            let this_piece_len = self.storage.piece_len(piece_index)?;
            let available_in_piece = this_piece_len as u64 - offset_in_piece;
            let take = remaining.min(available_in_piece);

            let mut buf = vec![0u8; take as usize];
            piece_file.read_exact(&mut buf)?;
            out.write_all(&buf)?;

            written += take;
            offset += take;
            remaining -= take;
        }

        if written != len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("wrote {} bytes for file, expected exactly {}", written, len),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileInfo;

    fn make_storage(structure: FsStructure, piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: structure.download_len(),
            download_dir: PathBuf::from("/unused"),
            structure,
        }
    }

    #[test]
    fn test_sanitize_dir_name() {
        assert_eq!(sanitize_dir_name("My Torrent! (2024)"), "mytorrent2024");
    }

    #[test]
    fn test_curr_pieces_scans_existing_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("out.bin"),
            len: 10,
            torrent_offset: 0,
        });
        let storage = make_storage(structure, 1, 10, 10);
        let writer = FileWriter::new(tmp.path(), "test torrent", storage).unwrap();
        writer.write_piece(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();

        let pieces = writer.curr_pieces().unwrap();
        assert!(pieces.contains(&0));
    }

    #[test]
    fn test_write_files_single_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("out.bin"),
            len: 20,
            torrent_offset: 0,
        });
        let storage = make_storage(structure, 2, 10, 10);
        let writer = FileWriter::new(tmp.path(), "roundtrip", storage).unwrap();
        writer.write_piece(0, &[1u8; 10]).unwrap();
        writer.write_piece(1, &[2u8; 10]).unwrap();
        writer.write_files().unwrap();

        let out_path = tmp.path().join("roundtrip").join("files").join("out.bin");
        let contents = fs::read(out_path).unwrap();
        let mut expected = vec![1u8; 10];
        expected.extend(vec![2u8; 10]);
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_write_files_multi_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![
            FileInfo { path: PathBuf::from("a.bin"), len: 6, torrent_offset: 0 },
            FileInfo { path: PathBuf::from("sub/b.bin"), len: 6, torrent_offset: 6 },
        ];
        let structure = FsStructure::Archive { files };
        let storage = make_storage(structure, 2, 6, 6);
        let writer = FileWriter::new(tmp.path(), "archive", storage).unwrap();
        writer.write_piece(0, &[9u8; 6]).unwrap();
        writer.write_piece(1, &[8u8; 6]).unwrap();
        writer.write_files().unwrap();

        let a = fs::read(tmp.path().join("archive").join("files").join("a.bin")).unwrap();
        let b = fs::read(tmp.path().join("archive").join("files").join("sub/b.bin")).unwrap();
        assert_eq!(a, vec![9u8; 6]);
        assert_eq!(b, vec![8u8; 6]);
    }
}
