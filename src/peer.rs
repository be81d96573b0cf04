//! A single outbound connection to a peer, implementing the leech-side
//! state machine: connect, handshake, parse the peer's piece availability,
//! then pipeline block requests for one piece at a time until the peer is
//! no longer useful.

use std::net::SocketAddrV4;
use std::sync::Arc;

use futures::{stream, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedParts};

use crate::codec::{HandshakeCodec, Message, PeerCodec};
use crate::disk::FileWriter;
use crate::error::PeerError;
use crate::metainfo::Handshake;
use crate::piece::{BlockWrite, Piece, PieceManager};
use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

/// Where in the handshake/bitfield/request sequence a session currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Not yet connected.
    ConnectionPending,
    /// TCP connected; our handshake has been sent and we're waiting for the
    /// peer's.
    HandshakePending,
    /// Handshake exchanged; waiting for the peer to describe which pieces
    /// it has, via `bitfield` and/or `have`.
    BitfieldParsing,
    /// We've established the peer has at least one piece we want and are
    /// requesting blocks from it.
    RequestPassing,
}

/// What to send back to the peer in response to a message, if anything.
enum Reply {
    None,
    One(Message),
    Many(Vec<Message>),
}

/// A single peer connection's session state, independent of the
/// connection/transport itself.
struct SessionState {
    state: State,
    bitfield: Option<Bitfield>,
    piece: Option<Piece>,
    am_interested: bool,
    choked_by_peer: bool,
    /// Set once there is nothing more to usefully exchange with this peer
    /// (it has no pieces we need, or we've exhausted the torrent).
    done: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            state: State::ConnectionPending,
            bitfield: None,
            piece: None,
            am_interested: false,
            choked_by_peer: true,
            done: false,
        }
    }
}

/// An outbound session with a single peer.
pub struct PeerSession {
    addr: SocketAddrV4,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_count: usize,
    piece_manager: Arc<Mutex<PieceManager>>,
    writer: Arc<FileWriter>,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddrV4,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
        piece_manager: Arc<Mutex<PieceManager>>,
        writer: Arc<FileWriter>,
    ) -> Self {
        Self {
            addr,
            info_hash,
            client_id,
            piece_count,
            piece_manager,
            writer,
        }
    }

    /// Connects to the peer, exchanges handshakes, and runs the session to
    /// completion. Returns once the connection closes, whether because we
    /// chose to close it, the peer did, or a protocol error occurred.
    pub async fn run(&mut self) -> Result<(), PeerError> {
        let mut session = SessionState::new();

        log::info!("connecting to peer {}", self.addr);
        session.state = State::ConnectionPending;
        let socket = TcpStream::connect(std::net::SocketAddr::V4(self.addr)).await?;

        let mut handshake_transport = Framed::new(socket, HandshakeCodec);

        session.state = State::HandshakePending;
        let our_handshake = Handshake::new(self.info_hash, self.client_id);
        handshake_transport
            .send(our_handshake)
            .await
            .map_err(PeerError::Codec)?;

        let peer_handshake = handshake_transport
            .next()
            .await
            .ok_or(PeerError::HandshakeInvalid)?
            .map_err(PeerError::Codec)?;
        if peer_handshake.info_hash != self.info_hash {
            log::warn!("peer {} sent handshake for a different torrent", self.addr);
            return Err(PeerError::HandshakeInvalid);
        }
        log::info!("peer {} handshake valid", self.addr);

        // Preserve any bytes the peer already pipelined after its handshake
        // by handing the old codec's buffers to the new one, rather than
        // discarding them.
        let old_parts = handshake_transport.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let transport = Framed::from_parts(new_parts);

        session.state = State::BitfieldParsing;
        let (mut sink, mut stream) = transport.split();

        let result = loop {
            if session.done {
                break Ok(());
            }

            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => break Err(PeerError::Codec(e)),
                None => break Ok(()),
            };

            let reply = match self.evaluate(&mut session, message).await {
                Ok(reply) => reply,
                Err(e) => break Err(e),
            };

            let send_result = match reply {
                Reply::None => Ok(()),
                Reply::One(message) => sink.send(message).await,
                Reply::Many(messages) => {
                    sink.send_all(&mut stream::iter(messages.into_iter().map(Ok))).await
                }
            };
            if let Err(e) = send_result {
                break Err(PeerError::Codec(e));
            }
        };

        self.lose_connection(&mut session).await;
        result
    }

    /// Dispatches a single parsed message against the current session
    /// state, returning what (if anything) to send back immediately.
    async fn evaluate(
        &self,
        session: &mut SessionState,
        message: Message,
    ) -> Result<Reply, PeerError> {
        if let Message::KeepAlive = message {
            return Ok(Reply::One(Message::KeepAlive));
        }

        match session.state {
            State::BitfieldParsing => self.evaluate_bitfield_parsing(session, message).await,
            State::RequestPassing => self.evaluate_request_passing(session, message).await,
            State::ConnectionPending | State::HandshakePending => {
                Err(PeerError::ProtocolViolation(
                    "received a message before handshake completed".to_string(),
                ))
            }
        }
    }

    async fn evaluate_bitfield_parsing(
        &self,
        session: &mut SessionState,
        message: Message,
    ) -> Result<Reply, PeerError> {
        match message {
            Message::Bitfield(mut bitfield) => {
                // The bitfield's raw byte length may pad out past the
                // logical piece count; truncate to the real length.
                bitfield.resize(self.piece_count, false);
                session.bitfield = Some(bitfield);
                session.am_interested = true;
                session.state = State::RequestPassing;
                Ok(Reply::One(Message::Interested))
            }
            Message::Have { piece_index } => {
                // Resolves the case of a peer sending `have` before any
                // `bitfield`: lazily initialize an empty one.
                let bitfield = session
                    .bitfield
                    .get_or_insert_with(|| Bitfield::repeat(false, self.piece_count));
                if piece_index < bitfield.len() {
                    bitfield.set(piece_index, true);
                }
                Ok(Reply::None)
            }
            Message::Choke => {
                session.choked_by_peer = true;
                if self.try_acquire_piece(session).await {
                    session.am_interested = true;
                    Ok(Reply::One(Message::Interested))
                } else {
                    Ok(Reply::One(Message::NotInterested))
                }
            }
            Message::Unchoke => {
                session.choked_by_peer = false;
                if session.piece.is_some() {
                    session.state = State::RequestPassing;
                    Ok(Reply::Many(self.request_all(session)))
                } else {
                    Ok(Reply::None)
                }
            }
            other => Err(PeerError::ProtocolViolation(format!(
                "unexpected message {:?} during bitfield parsing",
                other
            ))),
        }
    }

    async fn evaluate_request_passing(
        &self,
        session: &mut SessionState,
        message: Message,
    ) -> Result<Reply, PeerError> {
        match message {
            Message::Piece { index, begin, block } => {
                let finished_index;
                let finished_bytes;
                {
                    let piece = session.piece.as_mut().ok_or_else(|| {
                        PeerError::ProtocolViolation(
                            "received a piece block while holding none".to_string(),
                        )
                    })?;
                    match piece.write_block(index, begin, block)? {
                        BlockWrite::Incomplete => return Ok(Reply::One(Message::KeepAlive)),
                        BlockWrite::Complete(bytes) => {
                            finished_index = piece.index;
                            finished_bytes = bytes;
                        }
                    }
                }

                self.writer
                    .write_piece(finished_index, &finished_bytes)
                    .map_err(|e| match e {
                        crate::error::Error::Io(io_err) => PeerError::DiskIo(io_err),
                        other => PeerError::ProtocolViolation(other.to_string()),
                    })?;
                log::info!("peer {} finished piece {}", self.addr, finished_index);
                session.piece = None;

                if self.try_acquire_piece(session).await {
                    Ok(Reply::Many(self.request_all(session)))
                } else {
                    log::info!(
                        "peer {} has no more pieces we need, closing connection",
                        self.addr
                    );
                    session.done = true;
                    Ok(Reply::None)
                }
            }
            Message::Unchoke => {
                session.choked_by_peer = false;
                if !session.am_interested {
                    return Ok(Reply::None);
                }
                if session.piece.is_some() || self.try_acquire_piece(session).await {
                    Ok(Reply::Many(self.request_all(session)))
                } else {
                    log::info!(
                        "peer {} has no pieces we need, closing connection",
                        self.addr
                    );
                    session.done = true;
                    Ok(Reply::None)
                }
            }
            Message::Choke => {
                session.choked_by_peer = true;
                Ok(Reply::None)
            }
            other => Err(PeerError::ProtocolViolation(format!(
                "unexpected message {:?} during request passing",
                other
            ))),
        }
    }

    /// Attempts to check out a piece from the shared queue using the
    /// session's current bitfield, storing it in `session.piece` on
    /// success. A no-op (returning `true`) if a piece is already held.
    async fn try_acquire_piece(&self, session: &mut SessionState) -> bool {
        if session.piece.is_some() {
            return true;
        }
        let Some(bitfield) = session.bitfield.as_ref() else {
            return false;
        };
        let mut manager = self.piece_manager.lock().await;
        if let Some(piece) = manager.acquire(bitfield) {
            session.piece = Some(piece);
            true
        } else {
            false
        }
    }

    /// Builds a `request` message for every block of the currently held
    /// piece. Requests the whole piece up front rather than one block at a
    /// time, since there is no per-peer pipelining limit to respect.
    fn request_all(&self, session: &SessionState) -> Vec<Message> {
        let piece = session.piece.as_ref().expect("caller ensures piece is held");
        piece
            .blocks
            .iter()
            .map(|&(begin, len)| {
                Message::Request(BlockInfo {
                    piece_index: piece.index,
                    begin,
                    len,
                })
            })
            .collect()
    }

    /// Closes the session: returns any held piece to the shared queue and
    /// logs overall download progress.
    async fn lose_connection(&self, session: &mut SessionState) {
        if let Some(piece) = session.piece.take() {
            log::info!(
                "peer {} disconnected, returning piece {} to queue",
                self.addr,
                piece.index
            );
            self.piece_manager.lock().await.release(piece);
        }
        match self.writer.curr_pieces() {
            Ok(done) if done.len() == self.piece_count => {
                log::info!("all {} pieces downloaded", self.piece_count);
            }
            Ok(done) => {
                log::debug!("progress: {}/{} pieces", done.len(), self.piece_count);
            }
            Err(e) => log::warn!("failed to check download progress: {}", e),
        }
    }
}
