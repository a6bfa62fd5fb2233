//! Metadata layer for the Shoal BitTorrent client.
//!
//! This library decodes `.torrent` files into a [`Torrent`] descriptor and
//! provides the piece geometry the download engine is built on.

pub mod bencoding;
pub mod geometry;

use bencoding::{Bencode, BencodeError, InfoSliceError, decode, find_info_slice, info_hash};
pub use geometry::{piece_count, piece_size};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or validating torrent metadata.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bencode: {0}")]
    Bencode(#[from] BencodeError),

    #[error("cannot locate info dictionary: {0}")]
    InfoSlice(#[from] InfoSliceError),

    #[error("missing or invalid field `{0}`")]
    Field(&'static str),

    #[error("pieces field length {0} is not a multiple of 20")]
    PiecesLength(usize),

    #[error("expected {expected} piece hashes for {total_length} bytes, found {found}")]
    PieceCountMismatch {
        expected: usize,
        found: usize,
        total_length: u64,
    },

    #[error("unsafe file path {0:?}")]
    UnsafePath(Vec<String>),
}

/// Information about a single file in a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The length of the file in bytes.
    pub length: u64,
    /// The path components of the file.
    pub path: Vec<String>,
}

/// A file of the content, relative to the download directory, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Represents the metadata of a torrent.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// The URL of the tracker.
    pub announce: String,
    /// Optional list of backup trackers (tier-based).
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The SHA-1 hash of the info dictionary.
    pub info_hash: [u8; 20],
    /// The length of a single piece in bytes.
    pub piece_length: u64,
    /// The list of SHA-1 hashes for each piece.
    pub pieces: Vec<[u8; 20]>,
    /// The name of the file or directory.
    pub name: String,
    /// Total length of the file (single-file mode).
    pub length: Option<u64>,
    /// List of files (multi-file mode).
    pub files: Option<Vec<FileInfo>>,
}

impl Torrent {
    /// Total content length across all files.
    pub fn total_length(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        piece_size(self.piece_length, self.total_length(), index)
    }

    /// The file layout as a flat list, in the order the content is addressed.
    ///
    /// A single-file torrent yields one entry named after the torrent; a
    /// multi-file torrent yields `name/<path...>` for each file.
    pub fn files(&self) -> Vec<FileEntry> {
        match &self.files {
            Some(files) if self.length.is_none() => files
                .iter()
                .map(|f| FileEntry {
                    path: f.path.iter().fold(PathBuf::from(&self.name), |p, c| p.join(c)),
                    length: f.length,
                })
                .collect(),
            _ => vec![FileEntry {
                path: PathBuf::from(&self.name),
                length: self.total_length(),
            }],
        }
    }

    /// Checks the descriptor is internally consistent and safe to write to disk.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::Field("piece length"));
        }
        let expected = piece_count(self.piece_length, self.total_length());
        if expected != self.pieces.len() {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                found: self.pieces.len(),
                total_length: self.total_length(),
            });
        }
        if !is_safe_component(&self.name) {
            return Err(MetainfoError::UnsafePath(vec![self.name.clone()]));
        }
        if let Some(files) = &self.files {
            for f in files {
                if f.path.is_empty() || !f.path.iter().all(|c| is_safe_component(c)) {
                    return Err(MetainfoError::UnsafePath(f.path.clone()));
                }
            }
        }
        Ok(())
    }
}

fn is_safe_component(component: &str) -> bool {
    let mut components = Path::new(component).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Parses a `.torrent` file from the disk.
pub fn parse_torrent(path: impl AsRef<Path>) -> Result<Torrent, MetainfoError> {
    let buf = std::fs::read(path)?;
    parse_torrent_from_bytes(&buf)
}

/// Parses a torrent from a byte slice.
///
/// # Arguments
///
/// * `buf` - The byte slice containing the bencoded torrent data.
pub fn parse_torrent_from_bytes(buf: &[u8]) -> Result<Torrent, MetainfoError> {
    let root = decode(buf)?;
    let hash = info_hash(find_info_slice(buf)?);

    let announce = root
        .get(b"announce")
        .and_then(Bencode::as_str_lossy)
        .unwrap_or_default();

    let announce_list = root.get(b"announce-list").and_then(Bencode::as_list).map(|tiers| {
        tiers
            .iter()
            .filter_map(Bencode::as_list)
            .map(|urls| urls.iter().filter_map(Bencode::as_str_lossy).collect::<Vec<_>>())
            .filter(|tier| !tier.is_empty())
            .collect::<Vec<_>>()
    });
    let announce_list = announce_list.filter(|tiers| !tiers.is_empty());

    let info = root.get(b"info").ok_or(MetainfoError::Field("info"))?;
    if info.as_dict().is_none() {
        return Err(MetainfoError::Field("info"));
    }

    let name = info
        .get(b"name")
        .and_then(Bencode::as_str_lossy)
        .ok_or(MetainfoError::Field("name"))?;

    let piece_length = info
        .get(b"piece length")
        .and_then(Bencode::as_int)
        .filter(|&i| i > 0)
        .ok_or(MetainfoError::Field("piece length"))? as u64;

    let pieces_bytes = info
        .get(b"pieces")
        .and_then(Bencode::as_bytes)
        .ok_or(MetainfoError::Field("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::PiecesLength(pieces_bytes.len()));
    }
    let pieces = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let length = match info.get(b"length") {
        Some(value) => Some(
            value
                .as_int()
                .filter(|&i| i >= 0)
                .ok_or(MetainfoError::Field("length"))? as u64,
        ),
        None => None,
    };

    let files = match info.get(b"files").map(Bencode::as_list) {
        Some(Some(list)) => Some(
            list.iter()
                .map(parse_file_entry)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(None) => return Err(MetainfoError::Field("files")),
        None => None,
    };

    if length.is_none() && files.is_none() {
        return Err(MetainfoError::Field("length"));
    }

    Ok(Torrent {
        announce,
        announce_list,
        info_hash: hash,
        piece_length,
        pieces,
        name,
        length,
        files,
    })
}

fn parse_file_entry(entry: &Bencode) -> Result<FileInfo, MetainfoError> {
    let length = entry
        .get(b"length")
        .and_then(Bencode::as_int)
        .filter(|&i| i >= 0)
        .ok_or(MetainfoError::Field("files.length"))? as u64;
    let path = entry
        .get(b"path")
        .and_then(Bencode::as_list)
        .ok_or(MetainfoError::Field("files.path"))?
        .iter()
        .map(|c| c.as_str_lossy().ok_or(MetainfoError::Field("files.path")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FileInfo { length, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_dummy_torrent() -> Vec<u8> {
        let mut t = concat!(
            "d8:announce15:http://track.er4:infod6:lengthi12345e",
            "4:name8:testfile12:piece lengthi16384e6:pieces20:"
        )
        .as_bytes()
        .to_vec();
        t.extend_from_slice(&[b'X'; 20]);
        t.extend_from_slice(b"ee");
        t
    }

    fn create_multi_file_torrent() -> Vec<u8> {
        let mut t = concat!(
            "d4:infod5:filesld6:lengthi10e4:pathl1:a5:b.txteed6:lengthi6e4:pathl5:c.bineee",
            "4:name3:dir12:piece lengthi8e6:pieces40:"
        )
        .as_bytes()
        .to_vec();
        t.extend_from_slice(&[b'Y'; 40]);
        t.extend_from_slice(b"ee");
        t
    }

    #[test]
    fn test_parse_simple_torrent() {
        let buf = create_dummy_torrent();
        let t = parse_torrent_from_bytes(&buf).expect("Should parse");
        assert_eq!(t.announce, "http://track.er");
        assert_eq!(t.name, "testfile");
        assert_eq!(t.length, Some(12345));
        assert_eq!(t.piece_length, 16384);
        assert_eq!(t.pieces.len(), 1);
        assert!(t.files.is_none());
        t.validate().expect("consistent descriptor");
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        let buf = create_dummy_torrent();
        let t = parse_torrent_from_bytes(&buf).unwrap();
        let start = buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let raw_info = &buf[start..buf.len() - 1];
        assert_eq!(t.info_hash, info_hash(raw_info));
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let buf = create_multi_file_torrent();
        let t = parse_torrent_from_bytes(&buf).unwrap();
        assert_eq!(t.total_length(), 16);
        assert_eq!(t.piece_count(), 2);
        assert_eq!(
            t.files(),
            vec![
                FileEntry {
                    path: PathBuf::from("dir").join("a").join("b.txt"),
                    length: 10
                },
                FileEntry {
                    path: PathBuf::from("dir").join("c.bin"),
                    length: 6
                },
            ]
        );
        t.validate().unwrap();
    }

    #[test]
    fn test_parse_invalid_torrent() {
        assert!(parse_torrent_from_bytes(b"invalid").is_err());
        assert!(matches!(
            parse_torrent_from_bytes(b"d4:infod4:name1:xee"),
            Err(MetainfoError::Field("piece length"))
        ));
    }

    #[test]
    fn test_validate_rejects_piece_count_mismatch() {
        let mut t = parse_torrent_from_bytes(&create_dummy_torrent()).unwrap();
        t.pieces.push([0u8; 20]);
        assert!(matches!(
            t.validate(),
            Err(MetainfoError::PieceCountMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_traversal() {
        let mut t = parse_torrent_from_bytes(&create_multi_file_torrent()).unwrap();
        t.files = Some(vec![FileInfo {
            length: 16,
            path: vec!["..".to_string(), "etc".to_string()],
        }]);
        assert!(matches!(t.validate(), Err(MetainfoError::UnsafePath(_))));

        t.files = None;
        t.length = Some(16);
        t.name = "/abs".to_string();
        assert!(matches!(t.validate(), Err(MetainfoError::UnsafePath(_))));
    }
}
