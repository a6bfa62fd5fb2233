//! Extraction of the raw `info` value from a torrent file.

use super::decoder::{BencodeError, Decoder};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InfoSliceError {
    #[error("top-level value is not a dictionary")]
    NotADictionary,
    #[error("no info key in top-level dictionary")]
    Missing,
    #[error(transparent)]
    Bencode(#[from] BencodeError),
}

/// Returns the exact bytes of the top-level `info` value.
///
/// The content identifier is defined over these bytes as they appear in the
/// file, so re-encoding a decoded value is not an option.
pub fn find_info_slice(input: &[u8]) -> Result<&[u8], InfoSliceError> {
    if input.first() != Some(&b'd') {
        return Err(InfoSliceError::NotADictionary);
    }

    let mut decoder = Decoder::new(&input[1..]);
    loop {
        if decoder.is_at_end() {
            return Err(BencodeError::UnexpectedEof("dictionary").into());
        }
        if input[1 + decoder.position()] == b'e' {
            return Err(InfoSliceError::Missing);
        }
        let key = decoder.skip_value()?;
        let value = decoder.skip_value()?;
        if &input[1 + key.start..1 + key.end] == b"4:info" {
            return Ok(&input[1 + value.start..1 + value.end]);
        }
    }
}
