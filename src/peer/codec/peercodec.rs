use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::blockinfo::{BlockData, BlockInfo};
use crate::error::peer::PeerError;
use crate::Bitfield;

use super::message::{HashRequest, Message, MessageId};

/// Block messages can carry up to a full 16 KiB block plus its header; any
/// advertised length well beyond that is not a block we requested and is
/// rejected outright rather than buffered.
const MAX_MESSAGE_LEN: u32 = 1 << 20;

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => encode_empty(MessageId::Choke, buf),
            Message::Unchoke => encode_empty(MessageId::Unchoke, buf),
            Message::Interested => encode_empty(MessageId::Interested, buf),
            Message::NotInterested => encode_empty(MessageId::NotInterested, buf),
            Message::HaveAll => encode_empty(MessageId::HaveAll, buf),
            Message::HaveNone => encode_empty(MessageId::HaveNone, buf),
            Message::Have { piece_index } => {
                let msg_len = 1 + 4;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                let msg_len = 1 + bytes.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Message::Request(info) => encode_block_info(MessageId::Request, info, buf),
            Message::Cancel(info) => encode_block_info(MessageId::Cancel, info, buf),
            Message::RejectRequest(info) => encode_block_info(MessageId::RejectRequest, info, buf),
            Message::SuggestPiece { piece_index } => {
                let msg_len = 1 + 4;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::SuggestPiece as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::AllowedFast { piece_index } => {
                let msg_len = 1 + 4;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let msg_len = 1 + 4 + 4 + data.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Port(port) => {
                let msg_len = 1 + 2;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended { id, payload } => {
                let msg_len = 1 + 1 + payload.len() as u32;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
            Message::HashRequest(req) => {
                let msg_len = 1 + HASH_REQUEST_FIELDS_LEN;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::HashRequest as u8);
                encode_hash_request_fields(&req, buf);
            }
            Message::HashReject(req) => {
                let msg_len = 1 + HASH_REQUEST_FIELDS_LEN;
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::HashReject as u8);
                encode_hash_request_fields(&req, buf);
            }
            Message::Hashes { request, hashes } => {
                let msg_len = 1 + HASH_REQUEST_FIELDS_LEN + (hashes.len() as u32 * 32);
                buf.put_u32(msg_len);
                buf.put_u8(MessageId::Hashes as u8);
                encode_hash_request_fields(&request, buf);
                for hash in &hashes {
                    buf.extend_from_slice(hash);
                }
            }
        }
        Ok(())
    }
}

const HASH_REQUEST_FIELDS_LEN: u32 = 32 + 4 + 4 + 4 + 4;

fn encode_hash_request_fields(req: &HashRequest, buf: &mut BytesMut) {
    buf.extend_from_slice(&req.pieces_root);
    buf.put_u32(req.base_layer);
    buf.put_u32(req.index);
    buf.put_u32(req.length);
    buf.put_u32(req.proof_layers);
}

fn encode_empty(id: MessageId, buf: &mut BytesMut) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn encode_block_info(id: MessageId, info: BlockInfo, buf: &mut BytesMut) {
    let msg_len = 1 + 4 + 4 + 4;
    buf.put_u32(msg_len);
    buf.put_u8(id as u8);
    buf.put_u32(info.piece_index as u32);
    buf.put_u32(info.offset);
    buf.put_u32(info.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut peek = Cursor::new(&buf);
        let msg_len = peek.get_u32();

        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MalformedFrame);
        }

        if (buf.len() as u64) < 4 + msg_len as u64 {
            // not enough data yet; reserve the rest so the next read fills
            // the whole message in one go where possible
            buf.reserve(4 + msg_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id_byte = buf.get_u8();
        let id = MessageId::from_u8(id_byte).ok_or(PeerError::MalformedFrame)?;
        let payload_len = msg_len as usize - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => {
                require_len(payload_len, 4)?;
                Message::Have {
                    piece_index: buf.get_u32() as usize,
                }
            }
            MessageId::Bitfield => {
                let data = buf.split_to(payload_len);
                Message::Bitfield(Bitfield::from_vec(data.to_vec()))
            }
            MessageId::Request => {
                require_len(payload_len, 12)?;
                Message::Request(decode_block_info(buf))
            }
            MessageId::Cancel => {
                require_len(payload_len, 12)?;
                Message::Cancel(decode_block_info(buf))
            }
            MessageId::RejectRequest => {
                require_len(payload_len, 12)?;
                Message::RejectRequest(decode_block_info(buf))
            }
            MessageId::SuggestPiece => {
                require_len(payload_len, 4)?;
                Message::SuggestPiece {
                    piece_index: buf.get_u32() as usize,
                }
            }
            MessageId::AllowedFast => {
                require_len(payload_len, 4)?;
                Message::AllowedFast {
                    piece_index: buf.get_u32() as usize,
                }
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(PeerError::MalformedFrame);
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let data: Bytes = buf.split_to(payload_len - 8).freeze();
                Message::Block {
                    piece_index,
                    offset,
                    data: BlockData::Owned(data.to_vec()),
                }
            }
            MessageId::Port => {
                require_len(payload_len, 2)?;
                Message::Port(buf.get_u16())
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(PeerError::MalformedFrame);
                }
                let ext_id = buf.get_u8();
                let payload = buf.split_to(payload_len - 1).to_vec();
                Message::Extended {
                    id: ext_id,
                    payload,
                }
            }
            MessageId::HashRequest | MessageId::HashReject => {
                require_len(payload_len, HASH_REQUEST_FIELDS_LEN as usize)?;
                let req = decode_hash_request_fields(buf);
                if id == MessageId::HashRequest {
                    Message::HashRequest(req)
                } else {
                    Message::HashReject(req)
                }
            }
            MessageId::Hashes => {
                if payload_len < HASH_REQUEST_FIELDS_LEN as usize
                    || (payload_len - HASH_REQUEST_FIELDS_LEN as usize) % 32 != 0
                {
                    return Err(PeerError::MalformedFrame);
                }
                let request = decode_hash_request_fields(buf);
                let hash_count = (payload_len - HASH_REQUEST_FIELDS_LEN as usize) / 32;
                let mut hashes = Vec::with_capacity(hash_count);
                for _ in 0..hash_count {
                    let mut hash = [0u8; 32];
                    buf.copy_to_slice(&mut hash);
                    hashes.push(hash);
                }
                Message::Hashes { request, hashes }
            }
        };

        Ok(Some(msg))
    }
}

fn require_len(actual: usize, expected: usize) -> Result<(), PeerError> {
    if actual != expected {
        Err(PeerError::MalformedFrame)
    } else {
        Ok(())
    }
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    let piece_index = buf.get_u32() as usize;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

fn decode_hash_request_fields(buf: &mut BytesMut) -> HashRequest {
    let mut pieces_root = [0u8; 32];
    buf.copy_to_slice(&mut pieces_root);
    let base_layer = buf.get_u32();
    let index = buf.get_u32();
    let length = buf.get_u32();
    let proof_layers = buf.get_u32();
    HashRequest {
        pieces_root,
        base_layer,
        index,
        length,
        proof_layers,
    }
}
