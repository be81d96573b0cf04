//! A minimal HTTP tracker client.
//!
//! Only the compact peer list response format is supported (`compact=1`),
//! and only `http`/`https` announce URLs. UDP trackers are out of scope.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::{self, Visitor};
use serde::Deserialize;

use crate::error::TrackerError;
use crate::{PeerId, Sha1Hash};

/// Escapes every byte outside `[A-Za-z0-9]`, since `info_hash`/`peer_id` are
/// raw binary data rather than text.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC;

/// A tracker's bencoded announce response, after peer decompaction.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce.
    pub interval: Duration,
    /// The peers the tracker currently knows about.
    pub peers: Vec<SocketAddrV4>,
}

/// An HTTP tracker client for a single torrent.
///
/// Validates its inputs once at construction, then caches the most recent
/// announce response until `interval` seconds have passed.
pub struct Tracker {
    client: reqwest::blocking::Client,
    announce_url: url::Url,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    last_announce: Option<(Instant, AnnounceResponse)>,
}

impl Tracker {
    /// Builds a tracker client, validating that `announce_url` uses a
    /// supported scheme.
    pub fn new(
        announce_url: &str,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
    ) -> Result<Self, TrackerError> {
        let url = url::Url::parse(announce_url)
            .map_err(|_| TrackerError::UnsupportedTracker(announce_url.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TrackerError::UnsupportedTracker(url.scheme().to_string()));
        }
        Ok(Self {
            client: reqwest::blocking::Client::new(),
            announce_url: url,
            info_hash,
            peer_id,
            port,
            last_announce: None,
        })
    }

    /// Fetches the current peer list from the tracker.
    ///
    /// If the previous announce is still within its `interval`, the cached
    /// response is returned instead of issuing a new request.
    pub fn get_peers(&mut self, left: u64) -> Result<AnnounceResponse, TrackerError> {
        if let Some((fetched_at, response)) = &self.last_announce {
            if fetched_at.elapsed() < response.interval {
                log::debug!("reusing cached tracker response, interval not yet elapsed");
                return Ok(response.clone());
            }
        }

        let mut url = self.announce_url.clone();
        let query = announce_query(&self.info_hash, &self.peer_id, self.port, left);
        url.set_query(Some(&query));

        log::info!("announcing to tracker {}", self.announce_url);
        let bytes = self
            .client
            .get(url)
            .send()?
            .error_for_status()?
            .bytes()?;
        let raw: RawAnnounceResponse = serde_bencode::from_bytes(&bytes)?;

        let response = AnnounceResponse {
            interval: Duration::from_secs(raw.interval),
            peers: raw.peers,
        };
        self.last_announce = Some((Instant::now(), response.clone()));
        Ok(response)
    }
}

/// Builds the announce query string by hand rather than through
/// `Url::query_pairs_mut`: `info_hash`/`peer_id` are already
/// percent-encoded raw bytes, and the query-pair builder's own escaping
/// would re-encode the `%` they contain.
fn announce_query(info_hash: &Sha1Hash, peer_id: &PeerId, port: u16, left: u64) -> String {
    format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode(info_hash, URL_ENCODE_RESERVED),
        percent_encode(peer_id, URL_ENCODE_RESERVED),
        port,
        left,
    )
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    interval: u64,
    #[serde(deserialize_with = "deserialize_compact_peers")]
    peers: Vec<SocketAddrV4>,
}

/// Deserializes the tracker's `peers` field, which is a single byte string
/// of 6-byte entries (4-byte IPv4 address, 2-byte big-endian port).
fn deserialize_compact_peers<'de, D>(
    deserializer: D,
) -> Result<Vec<SocketAddrV4>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct CompactPeersVisitor;

    impl<'de> Visitor<'de> for CompactPeersVisitor {
        type Value = Vec<SocketAddrV4>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peers byte string")
        }

        fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_compact_peers(bytes).map_err(de::Error::custom)
        }

        fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&bytes)
        }
    }

    deserializer.deserialize_bytes(CompactPeersVisitor)
}

fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::MalformedPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[127, 0, 0, 1]);
        raw.extend_from_slice(&6881u16.to_be_bytes());
        raw.extend_from_slice(&[10, 0, 0, 2]);
        raw.extend_from_slice(&51413u16.to_be_bytes());

        let peers = parse_compact_peers(&raw).unwrap();
        assert_eq!(
            peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51413),
            ]
        );
    }

    #[test]
    fn test_parse_compact_peers_rejects_malformed_length() {
        assert!(parse_compact_peers(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_announce_query_encodes_binary_fields_without_double_escaping() {
        // 'A' (0x41) is alphanumeric and must be left bare; 0xFF is not and
        // must come out as a bare, single-escaped "%FF" rather than
        // "%2541" (which is what `Url::query_pairs_mut` would produce if
        // handed an already percent-encoded string).
        let info_hash: Sha1Hash = {
            let mut h = [0u8; 20];
            h[0] = b'A';
            h[1] = 0xFF;
            h
        };
        let peer_id: PeerId = [0u8; 20];

        let query = announce_query(&info_hash, &peer_id, 6881, 1000);

        assert!(query.starts_with("info_hash=A%FF"));
        assert!(!query.contains("%25"));
        assert!(query.contains("&port=6881"));
        assert!(query.contains("&uploaded=0"));
        assert!(query.contains("&downloaded=0"));
        assert!(query.contains("&left=1000"));
        assert!(query.ends_with("&compact=1"));
    }

    #[test]
    fn test_tracker_new_rejects_unsupported_scheme() {
        let result = Tracker::new("udp://tracker.example.com:80", [0u8; 20], [0u8; 20], 6881);
        assert!(result.is_err());
    }

    #[test]
    fn test_tracker_new_accepts_http() {
        let tracker = Tracker::new("http://tracker.example.com/announce", [0u8; 20], [0u8; 20], 6881);
        assert!(tracker.is_ok());
    }

    #[test]
    fn test_get_peers_against_mock_server() {
        let mut server = mockito::Server::new();
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0xC8, 0x55]);
        body.extend_from_slice(b"e");

        let mock = server
            .mock("GET", mockito::Matcher::Regex(r"^/announce.*".to_string()))
            .with_status(200)
            .with_body(body)
            .create();

        let url = format!("{}/announce", server.url());
        let mut tracker = Tracker::new(&url, [1u8; 20], [2u8; 20], 6881).unwrap();
        let response = tracker.get_peers(1000).unwrap();

        mock.assert();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(
            response.peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51413),
            ]
        );
    }
}
