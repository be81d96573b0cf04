//! This module defines types used to configure the engine and its parts.

use std::path::PathBuf;

use crate::PeerId;

/// The default leechtorrent client id, sent in every handshake and tracker
/// announce.
pub const LEECHTORRENT_CLIENT_ID: &PeerId = b"-LT0001-000000000000";

/// The subdirectory of the user's data directory leechtorrent downloads
/// into when no `-o`/`--output-dir` is given on the command line.
const DEFAULT_DATA_SUBDIR: &str = "leechtorrent";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub download: DownloadConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, using the given
    /// download directory and the default client id,
    /// [`LEECHTORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *LEECHTORRENT_CLIENT_ID,
            },
            download: DownloadConf::new(download_dir),
        }
    }

    /// Returns the configuration using the per-user default data directory.
    /// Falls back to `./<DEFAULT_DATA_SUBDIR>` if the platform's data
    /// directory cannot be determined.
    pub fn with_default_data_root() -> Self {
        let root = default_data_root();
        Self::new(root)
    }
}

/// Resolves the default per-user data root for downloads.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DATA_SUBDIR)
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a single torrent download.
#[derive(Clone, Debug)]
pub struct DownloadConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The port advertised to the tracker. We never actually listen for
    /// inbound connections (this is a leech-only client), but the protocol
    /// requires a port value regardless.
    pub port: u16,
}

impl DownloadConf {
    /// Returns the download configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            port: 6881,
        }
    }
}
