//! Wires the other modules together into a single end-to-end download run:
//! load the metainfo, announce to the tracker, spin up one [`PeerSession`]
//! per returned peer against a shared piece queue, and once every piece is
//! on disk, reassemble the output files.
//!
//! There is no re-announce loop and no retry of a failed peer: if every
//! peer disconnects before the torrent completes, the run simply ends
//! without having finished.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::conf::Conf;
use crate::disk::FileWriter;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer::PeerSession;
use crate::piece::PieceManager;
use crate::storage_info::StorageInfo;
use crate::tracker::Tracker;

/// Runs a complete leech of the torrent at `torrent_path`, writing its
/// files under `conf.download.download_dir`. Returns once every piece has
/// been downloaded and the output files have been written, or once every
/// peer has disconnected without finishing the torrent.
pub async fn run(torrent_path: impl AsRef<Path>, conf: Conf) -> Result<()> {
    let metainfo = Metainfo::from_path(torrent_path)?;
    log::info!(
        "loaded '{}' ({}): {} pieces, {} bytes total",
        metainfo.name,
        hex::encode(metainfo.info_hash),
        metainfo.piece_count(),
        metainfo.total_length
    );

    let storage = StorageInfo::new(&metainfo, conf.download.download_dir.clone());
    let writer = Arc::new(FileWriter::new(
        &conf.download.download_dir,
        &metainfo.name,
        storage,
    )?);

    let on_disk = writer.curr_pieces()?;
    let piece_count = metainfo.piece_count();
    log::info!("{}/{} pieces already on disk", on_disk.len(), piece_count);

    if on_disk.len() == piece_count {
        log::info!("torrent already complete, skipping announce");
        writer.write_files()?;
        return Ok(());
    }

    let downloaded_bytes = downloaded_bytes_on_disk(&metainfo, &on_disk);
    let left = metainfo.total_length.saturating_sub(downloaded_bytes);

    let piece_manager = Arc::new(Mutex::new(PieceManager::new(
        &metainfo.piece_hashes,
        metainfo.piece_length,
        metainfo.last_piece_length(),
        &on_disk,
    )));

    let mut tracker = Tracker::new(
        &metainfo.announce,
        metainfo.info_hash,
        conf.engine.client_id,
        conf.download.port,
    )?;
    let announce = tracker.get_peers(left)?;
    log::info!(
        "tracker returned {} peers, re-announce interval {}s",
        announce.peers.len(),
        announce.interval.as_secs()
    );

    let mut sessions = tokio::task::JoinSet::new();
    for addr in announce.peers {
        let mut session = PeerSession::new(
            addr,
            metainfo.info_hash,
            conf.engine.client_id,
            piece_count,
            Arc::clone(&piece_manager),
            Arc::clone(&writer),
        );
        sessions.spawn(async move { (addr, session.run().await) });
    }

    // A `DiskIo` failure is fatal to the whole run, unlike every other
    // per-peer error, which is logged and otherwise ignored: the swarm
    // just continues with its remaining peers.
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok((addr, Ok(()))) => log::debug!("peer {} session ended cleanly", addr),
            Ok((addr, Err(crate::error::PeerError::DiskIo(e)))) => {
                log::error!("fatal disk error persisting a piece from peer {}: {}", addr, e);
                sessions.abort_all();
                return Err(Error::Io(e));
            }
            Ok((addr, Err(e))) => log::warn!("peer {} disconnected: {}", addr, e),
            Err(join_err) => log::warn!("peer session task panicked: {}", join_err),
        }
    }

    let done = writer.curr_pieces()?;
    if done.len() == piece_count {
        log::info!("all {} pieces downloaded, writing output files", piece_count);
        writer.write_files()?;
        Ok(())
    } else {
        Err(Error::Incomplete {
            downloaded: done.len(),
            total: piece_count,
        })
    }
}

/// Sums the byte length of every piece index already present on disk, used
/// to compute the tracker's `left` parameter on the initial announce.
fn downloaded_bytes_on_disk(metainfo: &Metainfo, on_disk: &HashSet<crate::PieceIndex>) -> u64 {
    on_disk
        .iter()
        .filter_map(|&index| metainfo.piece_length_at(index))
        .map(|len| len as u64)
        .sum()
}

