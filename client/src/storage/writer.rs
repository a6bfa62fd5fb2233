use super::{Storage, StorageError};
use shoal_core::FileEntry;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

struct FileSlot {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

/// The part of a content-level range that falls inside one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub file: usize,
    pub file_offset: u64,
    /// Sub-range of the caller's buffer that belongs to this file.
    pub buf: Range<usize>,
}

/// Splits `offset..offset + len` across files laid out back to back.
///
/// `lengths` are the file sizes in declared order. Zero-length files never
/// receive a segment.
pub fn segments(lengths: &[u64], offset: u64, len: usize) -> Vec<Segment> {
    let end = offset + len as u64;
    let mut out = Vec::new();
    let mut file_start = 0u64;
    for (file, &length) in lengths.iter().enumerate() {
        let file_end = file_start + length;
        let lo = offset.max(file_start);
        let hi = end.min(file_end);
        if lo < hi {
            out.push(Segment {
                file,
                file_offset: lo - file_start,
                buf: (lo - offset) as usize..(hi - offset) as usize,
            });
        }
        if file_end >= end {
            break;
        }
        file_start = file_end;
    }
    out
}

/// Random-access writer over the pre-allocated destination file(s).
///
/// Multi-file content is one contiguous address space spanning the files in
/// declared order. Each file has its own lock, so writes to different files
/// proceed in parallel and writes to the same file are serialized.
pub struct StorageWriter {
    files: Vec<FileSlot>,
    lengths: Vec<u64>,
    total_length: u64,
    closed: AtomicBool,
}

impl StorageWriter {
    /// Creates (or reopens) every destination file and sizes it to its final length.
    ///
    /// Existing content is preserved so it can be re-verified on resume.
    pub async fn initialize(
        storage: &Storage,
        entries: &[FileEntry],
    ) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(entries.len());

        for entry in entries {
            let path = storage.get_file_path(&entry.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(StorageError::io(parent))?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(StorageError::io(&path))?;

            let current = file.metadata().await.map_err(StorageError::io(&path))?.len();
            if current != entry.length {
                file.set_len(entry.length)
                    .await
                    .map_err(StorageError::io(&path))?;
            }
            tracing::debug!(path = %path.display(), length = entry.length, "allocated file");

            files.push(FileSlot {
                path,
                handle: Mutex::new(Some(file)),
            });
        }

        let lengths: Vec<u64> = entries.iter().map(|e| e.length).collect();
        Ok(Self {
            files,
            total_length: lengths.iter().sum(),
            lengths,
            closed: AtomicBool::new(false),
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().map(|f| &f.path)
    }

    fn plan(&self, offset: u64, len: usize) -> Result<Vec<Segment>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let in_bounds = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.total_length);
        if !in_bounds {
            return Err(StorageError::OutOfBounds {
                offset,
                len: len as u64,
                total: self.total_length,
            });
        }
        Ok(segments(&self.lengths, offset, len))
    }

    /// Writes `data` at the absolute content offset `offset`.
    ///
    /// The range is validated before any byte is written, so a rejected write
    /// leaves the files untouched. A write straddling a file boundary is split.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        for seg in self.plan(offset, data.len())? {
            let slot = &self.files[seg.file];
            let mut guard = slot.handle.lock().await;
            let file = guard.as_mut().ok_or(StorageError::Closed)?;
            file.seek(SeekFrom::Start(seg.file_offset))
                .await
                .map_err(StorageError::io(&slot.path))?;
            file.write_all(&data[seg.buf])
                .await
                .map_err(StorageError::io(&slot.path))?;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at the absolute content offset `offset`.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; len];
        for seg in self.plan(offset, len)? {
            let slot = &self.files[seg.file];
            let mut guard = slot.handle.lock().await;
            let file = guard.as_mut().ok_or(StorageError::Closed)?;
            file.seek(SeekFrom::Start(seg.file_offset))
                .await
                .map_err(StorageError::io(&slot.path))?;
            file.read_exact(&mut buf[seg.buf])
                .await
                .map_err(StorageError::io(&slot.path))?;
        }
        Ok(buf)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flushes and releases every file handle.
    ///
    /// Only the first call does any work; later calls return `Ok(())`. All
    /// handles are released even if flushing one of them fails, and the first
    /// failure is reported.
    pub async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for slot in &self.files {
            let Some(mut file) = slot.handle.lock().await.take() else {
                continue;
            };
            let flushed = match file.flush().await {
                Ok(()) => file.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                first_err.get_or_insert(StorageError::io(&slot.path)(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
