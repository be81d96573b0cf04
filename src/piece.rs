//! The piece work queue shared by all peer sessions of a torrent.
//!
//! Pieces are handed out in roughly FIFO order: `acquire` pops the piece at
//! the front of the queue that the requesting peer's bitfield claims to
//! have, rotating past pieces the peer lacks. There is no rarest-first
//! accounting and no per-piece reservation beyond "whoever holds it holds
//! it until they release or complete it".

use std::collections::{HashSet, VecDeque};

use sha1::{Digest, Sha1};

use crate::error::PeerError;
use crate::{block_template, Bitfield, PieceIndex, Sha1Hash};

/// The result of writing a block into a piece's buffer.
#[derive(Debug)]
pub enum BlockWrite {
    /// More blocks are still needed before the piece is complete.
    Incomplete,
    /// Every block has arrived and the piece hash matched; the assembled
    /// bytes are returned for persistence.
    Complete(Vec<u8>),
}

/// A piece being assembled from blocks requested from one or more peers
/// (though in this client's single-holder model, at most one peer holds a
/// given piece at a time).
#[derive(Debug)]
pub struct Piece {
    pub index: PieceIndex,
    pub expected_hash: Sha1Hash,
    pub length: u32,
    /// The `(begin, len)` of every block that makes up this piece, in
    /// order.
    pub blocks: Vec<(u32, u32)>,
    block_data: Vec<Option<Vec<u8>>>,
    received_count: usize,
}

impl Piece {
    pub(crate) fn new(index: PieceIndex, expected_hash: Sha1Hash, length: u32) -> Self {
        let blocks = block_template(length);
        let block_data = vec![None; blocks.len()];
        Self {
            index,
            expected_hash,
            length,
            blocks,
            block_data,
            received_count: 0,
        }
    }

    /// Returns `true` once every block has been received (but before
    /// hash verification, which happens in [`Piece::write_block`]).
    pub fn is_complete(&self) -> bool {
        self.received_count == self.blocks.len()
    }

    /// Discards any partial block data, resetting the piece to the state
    /// it was in when first constructed.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.block_data {
            *slot = None;
        }
        self.received_count = 0;
    }

    /// Records a block of data for `begin`, and if this was the piece's
    /// last missing block, validates the assembled piece against its
    /// expected hash and length.
    pub fn write_block(
        &mut self,
        index: PieceIndex,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<BlockWrite, PeerError> {
        if index != self.index {
            return Err(PeerError::ProtocolViolation(format!(
                "received block for piece {} while holding piece {}",
                index, self.index
            )));
        }
        if begin % crate::BLOCK_SIZE != 0 {
            return Err(PeerError::ProtocolViolation(format!(
                "block begin {} is not block-aligned",
                begin
            )));
        }
        let block_index = (begin / crate::BLOCK_SIZE) as usize;
        let slot = self
            .block_data
            .get_mut(block_index)
            .ok_or_else(|| PeerError::ProtocolViolation(format!("block index {} out of range", block_index)))?;
        if slot.is_none() {
            self.received_count += 1;
        }
        *slot = Some(block);

        if !self.is_complete() {
            return Ok(BlockWrite::Incomplete);
        }

        let piece_bytes: Vec<u8> = self
            .block_data
            .iter()
            .flat_map(|b| b.as_ref().expect("piece marked complete with a missing block").iter().copied())
            .collect();

        if piece_bytes.len() as u32 != self.length {
            return Err(PeerError::ProtocolViolation(format!(
                "piece {} assembled to {} bytes, expected {}",
                self.index,
                piece_bytes.len(),
                self.length
            )));
        }

        let digest = Sha1::digest(&piece_bytes);
        if digest.as_slice() != self.expected_hash {
            return Err(PeerError::PieceHashMismatch(self.index));
        }

        Ok(BlockWrite::Complete(piece_bytes))
    }
}

/// The shared FIFO queue of pieces still needing to be downloaded.
pub struct PieceManager {
    queue: VecDeque<Piece>,
}

impl PieceManager {
    /// Builds the initial queue from a torrent's piece hashes and lengths,
    /// skipping any index already present in `on_disk`.
    pub fn new(
        piece_hashes: &[Sha1Hash],
        piece_length: u32,
        last_piece_length: u32,
        on_disk: &HashSet<PieceIndex>,
    ) -> Self {
        let piece_count = piece_hashes.len();
        let mut queue = VecDeque::with_capacity(piece_count);
        for (index, hash) in piece_hashes.iter().enumerate() {
            if on_disk.contains(&index) {
                continue;
            }
            let length = if index + 1 == piece_count {
                last_piece_length
            } else {
                piece_length
            };
            queue.push_back(Piece::new(index, *hash, length));
        }
        Self { queue }
    }

    /// Returns `true` once every piece has been downloaded and released
    /// (i.e. the queue is empty and nothing remains checked out).
    ///
    /// Note this only reflects the queue itself; a piece currently held by
    /// a peer session is neither in the queue nor reflected here until it
    /// is released back (on failure) or dropped (on success).
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Pops the first piece in the queue that `bitfield` claims to have,
    /// rotating past ones it doesn't. Returns `None` if no piece in the
    /// queue is available from this peer.
    pub fn acquire(&mut self, bitfield: &Bitfield) -> Option<Piece> {
        let attempts = self.queue.len();
        for _ in 0..attempts {
            let piece = self.queue.pop_front()?;
            let has_piece = bitfield.get(piece.index).map(|b| *b).unwrap_or(false);
            if has_piece {
                return Some(piece);
            }
            self.queue.push_back(piece);
        }
        None
    }

    /// Returns a piece to the back of the queue, e.g. because its peer
    /// disconnected before the piece completed. Any partial block data is
    /// discarded so the next peer to acquire it starts from scratch.
    pub fn release(&mut self, mut piece: Piece) {
        piece.clear();
        self.queue.push_back(piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn test_write_block_completes_and_validates_hash() {
        let data = vec![7u8; crate::BLOCK_SIZE as usize];
        let expected_hash = hash_of(&data);
        let mut piece = Piece::new(0, expected_hash, crate::BLOCK_SIZE);

        let result = piece.write_block(0, 0, data.clone()).unwrap();
        match result {
            BlockWrite::Complete(bytes) => assert_eq!(bytes, data),
            BlockWrite::Incomplete => panic!("expected piece to complete in one block"),
        }
    }

    #[test]
    fn test_write_block_rejects_hash_mismatch() {
        let data = vec![7u8; crate::BLOCK_SIZE as usize];
        let wrong_hash = [0u8; 20];
        let mut piece = Piece::new(0, wrong_hash, crate::BLOCK_SIZE);

        let err = piece.write_block(0, 0, data).unwrap_err();
        assert!(matches!(err, PeerError::PieceHashMismatch(0)));
    }

    #[test]
    fn test_write_block_rejects_wrong_piece_index() {
        let mut piece = Piece::new(0, [0u8; 20], crate::BLOCK_SIZE);
        let err = piece.write_block(1, 0, vec![0u8; crate::BLOCK_SIZE as usize]).unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation(_)));
    }

    #[test]
    fn test_manager_skips_on_disk_pieces() {
        let hashes = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
        let mut on_disk = HashSet::new();
        on_disk.insert(1);
        let manager = PieceManager::new(&hashes, crate::BLOCK_SIZE, crate::BLOCK_SIZE, &on_disk);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_acquire_rotates_past_unavailable_pieces() {
        let hashes = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
        let mut manager = PieceManager::new(&hashes, crate::BLOCK_SIZE, crate::BLOCK_SIZE, &HashSet::new());

        let mut bitfield = Bitfield::repeat(false, 3);
        bitfield.set(2, true);

        let piece = manager.acquire(&bitfield).unwrap();
        assert_eq!(piece.index, 2);
        // piece 0 and 1 remain in the queue, rotated back
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_acquire_returns_none_when_peer_has_nothing_we_need() {
        let hashes = vec![[1u8; 20], [2u8; 20]];
        let mut manager = PieceManager::new(&hashes, crate::BLOCK_SIZE, crate::BLOCK_SIZE, &HashSet::new());
        let bitfield = Bitfield::repeat(false, 2);
        assert!(manager.acquire(&bitfield).is_none());
        // queue is unchanged, not drained
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_release_returns_piece_to_queue() {
        let hashes = vec![[1u8; 20]];
        let mut manager = PieceManager::new(&hashes, crate::BLOCK_SIZE, crate::BLOCK_SIZE, &HashSet::new());
        let mut bitfield = Bitfield::repeat(false, 1);
        bitfield.set(0, true);
        let piece = manager.acquire(&bitfield).unwrap();
        assert!(manager.is_empty());
        manager.release(piece);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_release_clears_partial_block_data() {
        // A two-block piece: the first peer writes one block, then
        // disconnects before finishing. The next peer to acquire this piece
        // must not inherit that stale block.
        let hashes = vec![[1u8; 20]];
        let piece_len = 2 * crate::BLOCK_SIZE;
        let mut manager = PieceManager::new(&hashes, piece_len, piece_len, &HashSet::new());
        let mut bitfield = Bitfield::repeat(false, 1);
        bitfield.set(0, true);

        let mut piece = manager.acquire(&bitfield).unwrap();
        let write = piece
            .write_block(0, 0, vec![9u8; crate::BLOCK_SIZE as usize])
            .unwrap();
        assert!(matches!(write, BlockWrite::Incomplete));
        assert_eq!(piece.received_count, 1);

        manager.release(piece);

        let reacquired = manager.acquire(&bitfield).unwrap();
        assert_eq!(reacquired.received_count, 0);
        assert!(reacquired.block_data.iter().all(|slot| slot.is_none()));
    }
}
