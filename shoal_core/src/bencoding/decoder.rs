use super::bencode::Bencode;
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

/// Errors produced while decoding bencoded input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input while parsing {0}")]
    UnexpectedEof(&'static str),

    #[error("invalid byte {byte:#04x} at position {pos}")]
    InvalidByte { byte: u8, pos: usize },

    #[error("invalid integer at position {pos}")]
    InvalidInteger { pos: usize },

    #[error("invalid string length at position {pos}")]
    InvalidLength { pos: usize },

    #[error("dictionary key at position {pos} is not a byte string")]
    NonStringKey { pos: usize },

    #[error("{0} trailing bytes after value")]
    TrailingData(usize),
}

/// Cursor over a bencoded buffer.
///
/// Tracks the read position so callers can recover the exact byte span of
/// any value, which is what the info-hash computation needs.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self, context: &'static str) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(context))
    }

    /// Decodes the next complete value.
    pub fn decode_value(&mut self) -> Result<Bencode, BencodeError> {
        match self.peek("value")? {
            b'i' => self.decode_int().map(Bencode::Int),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek("list")? != b'e' {
                    list.push(self.decode_value()?);
                }
                self.pos += 1;
                Ok(Bencode::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek("dictionary")? != b'e' {
                    let key_pos = self.pos;
                    if !self.peek("dictionary key")?.is_ascii_digit() {
                        return Err(BencodeError::NonStringKey { pos: key_pos });
                    }
                    let key = self.decode_bytes()?;
                    let value = self.decode_value()?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Bencode::Dict(dict))
            }
            b'0'..=b'9' => self.decode_bytes().map(Bencode::Bytes),
            byte => Err(BencodeError::InvalidByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    /// Skips the next value and returns the byte range it occupied.
    pub fn skip_value(&mut self) -> Result<Range<usize>, BencodeError> {
        let start = self.pos;
        self.decode_value()?;
        Ok(start..self.pos)
    }

    fn decode_int(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        self.pos += 1;
        let digits_start = self.pos;
        while self.peek("integer")? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        self.pos += 1;

        let invalid = BencodeError::InvalidInteger { pos: start };
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || !unsigned.iter().all(u8::is_ascii_digit)
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || digits == b"-0"
        {
            return Err(invalid);
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(invalid)
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek("string length")? != b':' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidLength { pos: start });
            }
            self.pos += 1;
        }
        let len = std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidLength { pos: start })?;
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::UnexpectedEof("string"))?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

/// Decodes a single value that must span the whole input.
pub fn decode(input: &[u8]) -> Result<Bencode, BencodeError> {
    let mut decoder = Decoder::new(input);
    let value = decoder.decode_value()?;
    let rest = input.len() - decoder.position();
    if rest != 0 {
        return Err(BencodeError::TrailingData(rest));
    }
    Ok(value)
}

/// Decodes the first value and ignores anything after it.
///
/// Some trackers pad their responses, so the tracker client uses this.
pub fn decode_prefix(input: &[u8]) -> Result<Bencode, BencodeError> {
    Decoder::new(input).decode_value()
}
