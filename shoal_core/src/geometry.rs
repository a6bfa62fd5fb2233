//! Piece geometry: how a content length is cut into fixed-size pieces.

/// Number of pieces needed to cover `total_length` bytes.
pub fn piece_count(piece_length: u64, total_length: u64) -> usize {
    if piece_length == 0 {
        return 0;
    }
    total_length.div_ceil(piece_length) as usize
}

/// Length of piece `index`, or 0 past the end.
pub fn piece_size(piece_length: u64, total_length: u64, index: usize) -> u64 {
    let start = (index as u64).saturating_mul(piece_length);
    total_length.saturating_sub(start).min(piece_length)
}
