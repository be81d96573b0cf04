//! The `leechtorrent` command-line client.
//!
//! ```text
//! leechtorrent <torrent-path> [-o <output-dir>]
//! ```

use std::path::PathBuf;

use clap::Parser;
use rand::Rng;

use leechtorrent::conf::Conf;

#[derive(Parser, Debug)]
#[command(name = "leechtorrent", version, about = "A leech-only BitTorrent client")]
struct Cli {
    /// Path to the `.torrent` metainfo file.
    torrent_path: PathBuf,
    /// Directory to write the downloaded files into. Defaults to a
    /// per-user data directory if omitted.
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli.torrent_path, cli.output_dir).await
}

async fn run(torrent_path: PathBuf, output_dir: Option<PathBuf>) -> anyhow::Result<()> {
    if !torrent_path.is_file() {
        anyhow::bail!("torrent path does not exist or is not a regular file: {:?}", torrent_path);
    }

    let mut conf = match output_dir {
        Some(dir) => {
            if !dir.is_dir() {
                anyhow::bail!("output directory does not exist or is not a directory: {:?}", dir);
            }
            Conf::new(dir)
        }
        None => Conf::with_default_data_root(),
    };
    // Each process picks its own random peer id tail at startup.
    conf.engine.client_id = random_peer_id();

    log::info!(
        "starting download of {:?} into {:?}",
        torrent_path,
        conf.download.download_dir
    );

    leechtorrent::engine::run(&torrent_path, conf).await?;
    log::info!("download complete");
    Ok(())
}

/// Generates a random 20-byte peer id, prefixed with the client's
/// identifying tag the way `conf::LEECHTORRENT_CLIENT_ID` is shaped.
fn random_peer_id() -> leechtorrent::PeerId {
    let mut id = *leechtorrent::conf::LEECHTORRENT_CLIENT_ID;
    let mut rng = rand::thread_rng();
    for byte in id.iter_mut().skip(8) {
        *byte = rng.gen();
    }
    id
}
