//! Segment files and on-disk naming.
//!
//! A segment is one fixed-size append-only file. Work segments form a ring
//! of `wal_segments` slots and are named by slot; archive segments are named
//! by absolute index. Both use the grammar
//! `<16-digit zero-padded index>.v<serializer version>.wal`, with a `.tmp`
//! suffix while a file is being created atomically.

use crate::error::WalError;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Absolute segment identifier (monotonically increasing).
pub type SegmentIndex = u64;

/// Suffix of finished segment files.
pub const WAL_SUFFIX: &str = ".wal";

/// Suffix of files being written atomically.
pub const TMP_SUFFIX: &str = ".tmp";

const FORMAT_CHUNK: usize = 64 * 1024;

/// Segment file name: `NNNNNNNNNNNNNNNN.v<version>.wal` (16 decimal digits).
pub fn segment_file_name(index: SegmentIndex, version: u16) -> String {
    format!("{index:016}.v{version}{WAL_SUFFIX}")
}

/// Parses `(index, version)` out of a segment file name.
pub fn parse_segment_file_name(name: &str) -> Option<(SegmentIndex, u16)> {
    let rest = name.strip_suffix(WAL_SUFFIX)?;
    if rest.len() < 19 {
        return None;
    }
    let (digits, version) = rest.split_at(16);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = version.strip_prefix(".v")?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, version.parse().ok()?))
}

/// One open segment file with positional write access.
///
/// `write_at` must be called with non-decreasing positions; the handle keeps
/// its own position so sequential drains skip the seek.
pub struct SegmentFile {
    path: PathBuf,
    file: Option<File>,
    position: u64,
}

impl SegmentFile {
    /// Creates a segment at `path` through a temp file and an atomic rename.
    ///
    /// When `prealloc` is set the file is filled with zeros up to `size` and
    /// synced before the rename, so a crash leaves either no file or a fully
    /// formatted one. The temp file is removed on error.
    pub fn create_and_format(path: &Path, size: u64, prealloc: bool) -> Result<(), WalError> {
        let tmp = tmp_path(path);
        let result = write_formatted(&tmp, size, prealloc)
            .and_then(|_| fs::rename(&tmp, path).map_err(WalError::from));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Opens an existing segment read-write, positioned at `initial_position`.
    pub fn open_rw(path: &Path, initial_position: u64) -> Result<Self, WalError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(initial_position))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            position: initial_position,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Writes `bytes` starting at `position` and advances the handle.
    pub fn write_at(&mut self, position: u64, bytes: &[u8]) -> Result<(), WalError> {
        debug_assert!(position >= self.position, "write_at must not move backwards");
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        if position != self.position {
            file.seek(SeekFrom::Start(position))?;
        }
        file.write_all(bytes)?;
        self.position = position + bytes.len() as u64;
        Ok(())
    }

    /// Flushes written bytes to the storage medium.
    pub fn force(&mut self) -> Result<(), WalError> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Releases the OS handle. Idempotent.
    pub fn close(&mut self) -> Result<(), WalError> {
        self.file.take();
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn write_formatted(tmp: &Path, size: u64, prealloc: bool) -> Result<(), WalError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    if prealloc {
        let zeros = vec![0u8; FORMAT_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(FORMAT_CHUNK as u64) as usize;
            file.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }
        file.sync_data()?;
    }
    Ok(())
}

/// Re-formats an existing work slot for reuse: zero-fill when pre-allocating,
/// truncate to empty otherwise.
pub fn format_existing(path: &Path, size: u64, prealloc: bool) -> Result<(), WalError> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    if prealloc {
        let zeros = vec![0u8; FORMAT_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(FORMAT_CHUNK as u64) as usize;
            file.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }
        file.sync_data()?;
    } else {
        file.set_len(0)?;
    }
    Ok(())
}

/// Lists archive segments in `dir`, sorted by absolute index.
pub fn scan_archive(dir: &Path) -> Result<Vec<(SegmentIndex, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((index, _)) = parse_segment_file_name(&name.to_string_lossy()) {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Finds the segment file for `index` in `dir`, whatever its version suffix.
pub fn find_segment_file(dir: &Path, index: SegmentIndex) -> Result<Option<PathBuf>, WalError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((found, _)) = parse_segment_file_name(&name.to_string_lossy()) {
            if found == index {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

/// Deletes leftover `.tmp` files from an interrupted atomic creation.
pub fn remove_tmp_files(dir: &Path) -> Result<usize, WalError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
            fs::remove_file(entry.path())?;
            removed += 1;
            tracing::debug!(path = %entry.path().display(), "removed leftover temp file");
        }
    }
    Ok(removed)
}
