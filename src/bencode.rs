//! A minimal, byte-oriented bencode codec.
//!
//! `.torrent` metadata itself is parsed through typed `serde_bencoded`
//! structs (see [`crate::metainfo`]), but the places where the shape is
//! dynamic — the LTEP extension handshake dict, and anything echoed back
//! byte-for-byte — need a value-level representation. `BencodeValue` is
//! that representation: byte-strings carry raw, possibly non-UTF-8 bytes,
//! dict keys are kept in strict lexicographic order on encode (as BEP 3
//! requires for info-hash-stable round tripping), and malformed input is
//! rejected rather than best-effort recovered.

use std::collections::BTreeMap;
use std::fmt;

/// A bencode value: integer, byte-string, list, or dict.
///
/// Dict keys are raw bytes (bencode keys need not be valid UTF-8), stored
/// sorted so `BencodeValue::Dict` always round-trips through `encode` with
/// the same byte layout it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

/// The wire codec's single fault kind: the input did not conform to the
/// bencode grammar, or a length-prefixed string's length exceeded what
/// remained in the buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid bencode format at offset {offset}")]
pub struct BencodeInvalidFormat {
    pub offset: usize,
}

pub type Result<T> = std::result::Result<T, BencodeInvalidFormat>;

impl BencodeValue {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(b.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Encodes this value, appending to `out`. Dict keys are visited in
    /// `BTreeMap` (i.e. lexicographic byte) order, satisfying BEP 3.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode(out);
                }
                out.push(b'e');
            }
            Self::Dict(map) => {
                out.push(b'd');
                for (k, v) in map {
                    Self::Bytes(k.clone()).encode(out);
                    v.encode(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decodes a single value starting at `input`'s beginning, returning the
    /// value and the remaining unconsumed bytes. Trailing garbage after a
    /// single top-level value is permitted (the caller decides whether that
    /// matters); embedded malformed structure is always rejected.
    pub fn decode(input: &[u8]) -> Result<(Self, &[u8])> {
        let mut cursor = Cursor { buf: input, pos: 0 };
        let value = cursor.parse_value()?;
        Ok((value, &input[cursor.pos..]))
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "<{} raw bytes>", b.len()),
            },
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {v}", String::from_utf8_lossy(k))?;
                }
                write!(f, "}}")
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn fail(&self) -> BencodeInvalidFormat {
        BencodeInvalidFormat { offset: self.pos }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        match self.peek().ok_or_else(|| self.fail())? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(BencodeValue::Bytes),
            _ => Err(self.fail()),
        }
    }

    fn parse_int(&mut self) -> Result<BencodeValue> {
        debug_assert_eq!(self.peek(), Some(b'i'));
        self.advance(1);
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.advance(1);
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance(1);
        }
        if self.pos == digits_start {
            return Err(self.fail());
        }
        // reject leading zeros (other than the literal "0") and "-0"
        let digits = &self.buf[digits_start..self.pos];
        if (digits.len() > 1 && digits[0] == b'0') || digits == b"0" && digits_start != start {
            return Err(self.fail());
        }
        if self.peek() != Some(b'e') {
            return Err(self.fail());
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos]).map_err(|_| self.fail())?;
        let value: i64 = text.parse().map_err(|_| self.fail())?;
        self.advance(1); // 'e'
        Ok(BencodeValue::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance(1);
        }
        if self.pos == start {
            return Err(self.fail());
        }
        let len_text = std::str::from_utf8(&self.buf[start..self.pos]).map_err(|_| self.fail())?;
        let len: usize = len_text.parse().map_err(|_| self.fail())?;
        if self.peek() != Some(b':') {
            return Err(self.fail());
        }
        self.advance(1);
        if self.pos + len > self.buf.len() {
            return Err(self.fail());
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.advance(len);
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        debug_assert_eq!(self.peek(), Some(b'l'));
        self.advance(1);
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.advance(1);
                    break;
                }
                Some(_) => items.push(self.parse_value()?),
                None => return Err(self.fail()),
            }
        }
        Ok(BencodeValue::List(items))
    }

    fn parse_dict(&mut self) -> Result<BencodeValue> {
        debug_assert_eq!(self.peek(), Some(b'd'));
        self.advance(1);
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.advance(1);
                    break;
                }
                Some(b'0'..=b'9') => {
                    let key = self.parse_bytes()?;
                    if let Some(last) = &last_key {
                        if key <= *last {
                            return Err(self.fail());
                        }
                    }
                    let value = self.parse_value()?;
                    last_key = Some(key.clone());
                    map.insert(key, value);
                }
                _ => return Err(self.fail()),
            }
        }
        Ok(BencodeValue::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) {
        let (value, rest) = BencodeValue::decode(input).expect("decode failed");
        assert!(rest.is_empty());
        assert_eq!(value.to_vec(), input);
    }

    #[test]
    fn test_int_roundtrip() {
        roundtrip(b"i42e");
        roundtrip(b"i0e");
        roundtrip(b"i-42e");
    }

    #[test]
    fn test_bytes_roundtrip() {
        roundtrip(b"4:spam");
        roundtrip(b"0:");
    }

    #[test]
    fn test_list_roundtrip() {
        roundtrip(b"l4:spam4:eggse");
        roundtrip(b"le");
    }

    #[test]
    fn test_dict_roundtrip() {
        roundtrip(b"d3:bar4:spam3:fooi42ee");
        roundtrip(b"de");
    }

    #[test]
    fn test_dict_forces_key_order_on_encode() {
        // decoding requires strictly ascending keys already, but verify that
        // a value built programmatically out of order still encodes sorted.
        let mut map = BTreeMap::new();
        map.insert(b"zzz".to_vec(), BencodeValue::Int(1));
        map.insert(b"aaa".to_vec(), BencodeValue::Int(2));
        let value = BencodeValue::Dict(map);
        assert_eq!(value.to_vec(), b"d3:aaai2e3:zzzi1ee");
    }

    #[test]
    fn test_nested_value() {
        let input = b"d4:infod6:lengthi12345e4:name8:test.isoee";
        let (value, rest) = BencodeValue::decode(input).unwrap();
        assert!(rest.is_empty());
        let info = value.get(b"info").unwrap();
        assert_eq!(info.get(b"length").unwrap().as_int(), Some(12345));
        assert_eq!(
            info.get(b"name").unwrap().as_bytes(),
            Some(b"test.iso".as_slice())
        );
    }

    #[test]
    fn test_rejects_malformed_format() {
        assert!(BencodeValue::decode(b"i4e2e").is_ok()); // "i4e" then trailing "2e" - not embedded, ok at top level
        assert!(BencodeValue::decode(b"i4.2e").is_err());
        assert!(BencodeValue::decode(b"5:ab").is_err()); // declared length exceeds buffer
        assert!(BencodeValue::decode(b"d3:fooe").is_err()); // dict value missing
        assert!(BencodeValue::decode(b"di1e4:spamE").is_err()); // int key not allowed
        assert!(BencodeValue::decode(b"").is_err());
    }

    #[test]
    fn test_dict_out_of_order_keys_rejected() {
        // "b" then "a" - not ascending
        assert!(BencodeValue::decode(b"d1:bi1e1:ai2ee").is_err());
    }

    #[test]
    fn test_decode_then_encode_is_identity() {
        let samples: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spam4:eggse",
            b"d3:bar4:spam3:fooi42ee",
            b"d4:infod6:lengthi12345e4:name8:test.isoee",
        ];
        for sample in samples {
            let (value, _) = BencodeValue::decode(sample).unwrap();
            assert_eq!(value.to_vec(), *sample);
        }
    }
}
