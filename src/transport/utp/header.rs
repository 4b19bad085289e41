//! The 20-byte uTP packet header of spec.md §4.5.
//!
//! ```txt
//! 0               1               2               3
//! 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |type(4)|ver(4) |    extension  |         connection_id        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          timestamp_us                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       timestamp_diff_us                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           wnd_size                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             seq_nr           |             ack_nr            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, BytesMut};

pub const HEADER_LEN: usize = 20;
pub const UTP_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PacketType::*;
        Some(match v {
            0 => Data,
            1 => Fin,
            2 => State,
            3 => Reset,
            4 => Syn,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ty: PacketType,
    pub extension: u8,
    pub connection_id: u16,
    pub timestamp_us: u32,
    pub timestamp_diff_us: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.ty as u8) << 4) | UTP_VERSION);
        buf.put_u8(self.extension);
        buf.put_u16(self.connection_id);
        buf.put_u32(self.timestamp_us);
        buf.put_u32(self.timestamp_diff_us);
        buf.put_u32(self.wnd_size);
        buf.put_u16(self.seq_nr);
        buf.put_u16(self.ack_nr);
    }

    /// Returns the decoded header and the number of bytes consumed, or
    /// `None` if `data` is shorter than [`HEADER_LEN`] or advertises an
    /// unsupported packet type/version.
    pub fn decode(mut data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let type_version = data.get_u8();
        let ty = PacketType::from_u8(type_version >> 4)?;
        if type_version & 0x0f != UTP_VERSION {
            return None;
        }
        let extension = data.get_u8();
        let connection_id = data.get_u16();
        let timestamp_us = data.get_u32();
        let timestamp_diff_us = data.get_u32();
        let wnd_size = data.get_u32();
        let seq_nr = data.get_u16();
        let ack_nr = data.get_u16();
        Some((
            Self {
                ty,
                extension,
                connection_id,
                timestamp_us,
                timestamp_diff_us,
                wnd_size,
                seq_nr,
                ack_nr,
            },
            HEADER_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            ty: PacketType::Data,
            extension: 0,
            connection_id: 4242,
            timestamp_us: 123_456,
            timestamp_diff_us: 789,
            wnd_size: 1 << 16,
            seq_nr: 7,
            ack_nr: 6,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let (decoded, consumed) = Header::decode(&buf).unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(Header::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x02); // type=Data(0), version=2 (unsupported)
        buf.put_bytes(0, HEADER_LEN - 1);
        assert!(Header::decode(&buf).is_none());
    }
}
