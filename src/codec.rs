//! The peer wire protocol message codec.
//!
//! Every message on the wire is framed as `<4-byte big-endian length prefix>
//! <message id><payload>`, except the zero-length keep-alive, which has no
//! id or payload. [`decode_frame`]/[`encode`] are pure functions operating
//! directly on a byte buffer; [`PeerCodec`] wraps them as a
//! `tokio_util::codec::{Decoder, Encoder}` for use with `Framed`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::metainfo::Handshake;
use crate::{Bitfield, BlockInfo, PieceIndex};

/// The length prefix and message id occupy 5 bytes for every non-keep-alive
/// message.
const HEADER_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self, CodecError> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            other => return Err(CodecError::UnknownMessageId(other)),
        })
    }
}

/// A parsed peer wire protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { index: PieceIndex, begin: u32, block: Vec<u8> },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

/// Attempts to decode a single frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` doesn't yet hold a complete frame, in which
/// case no bytes are consumed and the caller should wait for more data.
/// Otherwise the frame (including its length prefix) is drained from `buf`.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        buf.advance(4);
        return Ok(Some(Message::KeepAlive));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    let id_byte = buf[4];
    let id = MessageId::from_u8(id_byte)?;
    let payload_len = len - 1;

    let message = match id {
        MessageId::Choke => require_len(id_byte, payload_len, 0, Message::Choke)?,
        MessageId::Unchoke => require_len(id_byte, payload_len, 0, Message::Unchoke)?,
        MessageId::Interested => require_len(id_byte, payload_len, 0, Message::Interested)?,
        MessageId::NotInterested => {
            require_len(id_byte, payload_len, 0, Message::NotInterested)?
        }
        MessageId::Have => {
            if payload_len != 4 {
                return Err(CodecError::InvalidFrameLength {
                    message_id: id_byte,
                    len: len as u32,
                });
            }
            let piece_index = read_u32(buf, HEADER_LEN) as PieceIndex;
            Message::Have { piece_index }
        }
        MessageId::Bitfield => {
            let bytes = buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
            Message::Bitfield(Bitfield::from_vec(bytes))
        }
        MessageId::Request => {
            if payload_len != 12 {
                return Err(CodecError::InvalidFrameLength {
                    message_id: id_byte,
                    len: len as u32,
                });
            }
            Message::Request(read_block_info(buf, HEADER_LEN))
        }
        MessageId::Piece => {
            if payload_len < 8 {
                return Err(CodecError::InvalidFrameLength {
                    message_id: id_byte,
                    len: len as u32,
                });
            }
            let index = read_u32(buf, HEADER_LEN) as PieceIndex;
            let begin = read_u32(buf, HEADER_LEN + 4);
            let block = buf[HEADER_LEN + 8..HEADER_LEN + payload_len].to_vec();
            Message::Piece { index, begin, block }
        }
        MessageId::Cancel => {
            if payload_len != 12 {
                return Err(CodecError::InvalidFrameLength {
                    message_id: id_byte,
                    len: len as u32,
                });
            }
            Message::Cancel(read_block_info(buf, HEADER_LEN))
        }
        MessageId::Port => {
            if payload_len != 2 {
                return Err(CodecError::InvalidFrameLength {
                    message_id: id_byte,
                    len: len as u32,
                });
            }
            let port = u16::from_be_bytes([buf[HEADER_LEN], buf[HEADER_LEN + 1]]);
            Message::Port(port)
        }
    };

    buf.advance(4 + len);
    Ok(Some(message))
}

fn require_len<T>(
    id: u8,
    actual: usize,
    expected: usize,
    value: T,
) -> Result<T, CodecError> {
    if actual != expected {
        return Err(CodecError::InvalidFrameLength {
            message_id: id,
            len: actual as u32,
        });
    }
    Ok(value)
}

fn read_u32(buf: &BytesMut, offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_block_info(buf: &BytesMut, offset: usize) -> BlockInfo {
    BlockInfo {
        piece_index: read_u32(buf, offset) as PieceIndex,
        begin: read_u32(buf, offset + 4),
        len: read_u32(buf, offset + 8),
    }
}

/// Serializes `message` onto the end of `buf`.
pub fn encode(message: &Message, buf: &mut BytesMut) {
    match message {
        Message::KeepAlive => buf.put_u32(0),
        Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
            buf.put_u32(1);
            buf.put_u8(message.id().unwrap() as u8);
        }
        Message::Have { piece_index } => {
            buf.put_u32(5);
            buf.put_u8(MessageId::Have as u8);
            buf.put_u32(*piece_index as u32);
        }
        Message::Bitfield(bitfield) => {
            let bytes = bitfield.as_raw_slice();
            buf.put_u32(1 + bytes.len() as u32);
            buf.put_u8(MessageId::Bitfield as u8);
            buf.put_slice(bytes);
        }
        Message::Request(block) => {
            buf.put_u32(13);
            buf.put_u8(MessageId::Request as u8);
            buf.put_u32(block.piece_index as u32);
            buf.put_u32(block.begin);
            buf.put_u32(block.len);
        }
        Message::Piece { index, begin, block } => {
            buf.put_u32(9 + block.len() as u32);
            buf.put_u8(MessageId::Piece as u8);
            buf.put_u32(*index as u32);
            buf.put_u32(*begin);
            buf.put_slice(block);
        }
        Message::Cancel(block) => {
            buf.put_u32(13);
            buf.put_u8(MessageId::Cancel as u8);
            buf.put_u32(block.piece_index as u32);
            buf.put_u32(block.begin);
            buf.put_u32(block.len);
        }
        Message::Port(port) => {
            buf.put_u32(3);
            buf.put_u8(MessageId::Port as u8);
            buf.put_u16(*port);
        }
    }
}

/// Encodes a `request` message for every block of `piece_index`, given the
/// piece's `(begin, len)` block template (see `block_template`).
pub fn encode_request_all(piece_index: PieceIndex, blocks: &[(u32, u32)]) -> BytesMut {
    let mut buf = BytesMut::new();
    for &(begin, len) in blocks {
        encode(
            &Message::Request(BlockInfo { piece_index, begin, len }),
            &mut buf,
        );
    }
    buf
}

/// Wraps [`decode_frame`]/[`encode`] as a `tokio_util::codec` pair for
/// framing an established peer connection's byte stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        decode_frame(src)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode(&item, dst);
        Ok(())
    }
}

/// Frames the fixed-size 68-byte handshake exchanged before either side
/// switches to [`PeerCodec`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, CodecError> {
        if src.len() < Handshake::LEN {
            return Ok(None);
        }
        let bytes = src.split_to(Handshake::LEN);
        Ok(Handshake::decode(&bytes))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_keep_alive() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let message = decode_frame(&mut buf).unwrap();
        assert_eq!(message, Some(Message::KeepAlive));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_request_frame() {
        let mut buf = BytesMut::new();
        encode(
            &Message::Request(BlockInfo { piece_index: 0, begin: 0x8000, len: 0x4000 }),
            &mut buf,
        );
        assert_eq!(
            buf.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 0, 0, 0, 0x80, 0, 0, 0, 0x40, 0][..]
        );
        let message = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            message,
            Message::Request(BlockInfo { piece_index: 0, begin: 0x8000, len: 0x4000 })
        );
    }

    #[test]
    fn test_decode_partial_frame_returns_none_without_consuming() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 13, 6, 0, 0][..]);
        let before = buf.clone();
        let message = decode_frame(&mut buf).unwrap();
        assert_eq!(message, None);
        assert_eq!(buf, before);
    }

    #[test]
    fn test_decode_unknown_message_id() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 200][..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::UnknownMessageId(200))
        ));
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode(&Message::Unchoke, &mut buf);
        encode(&Message::Interested, &mut buf);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Message::Interested));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bitfield_round_trip() {
        let mut bitfield = Bitfield::repeat(false, 10);
        bitfield.set(0, true);
        bitfield.set(1, true);
        bitfield.set(9, true);

        let mut buf = BytesMut::new();
        encode(&Message::Bitfield(bitfield.clone()), &mut buf);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Bitfield(b) => assert_eq!(b, bitfield),
            other => panic!("expected bitfield, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_request_all() {
        let blocks = vec![(0, 0x4000), (0x4000, 0x4000)];
        let buf = encode_request_all(3, &blocks);
        let mut buf = buf;
        let first = decode_frame(&mut buf).unwrap().unwrap();
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            Message::Request(BlockInfo { piece_index: 3, begin: 0, len: 0x4000 })
        );
        assert_eq!(
            second,
            Message::Request(BlockInfo { piece_index: 3, begin: 0x4000, len: 0x4000 })
        );
    }
}
