//! Replay of logged records.
//!
//! A replay is a lazy, finite, non-restartable walk over `(pointer, record)`
//! pairs, starting at a configurable pointer and crossing from the archive
//! directory into the work ring. While a work slot is being read it is
//! pinned, so the archiver cannot re-format it underneath the reader.

use crate::archive::SegmentArchiver;
use crate::error::WalError;
use crate::pointer::WalPointer;
use crate::record::{ReadOutcome, RecordCodec, WalRecord};
use crate::segment;
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

struct OpenSegment {
    reader: BufReader<File>,
    offset: u32,
    /// Whether a work-slot pin is held for the current segment index.
    pinned: bool,
}

/// Iterator over records from a start pointer to an optional end segment.
pub struct WalReplay {
    codec: Arc<RecordCodec>,
    archiver: Arc<SegmentArchiver>,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    segment_count: u64,
    start: Option<WalPointer>,
    end_index: Option<u64>,
    cur_index: u64,
    current: Option<OpenSegment>,
    finished: bool,
}

impl WalReplay {
    pub(crate) fn new(
        codec: Arc<RecordCodec>,
        archiver: Arc<SegmentArchiver>,
        work_dir: PathBuf,
        archive_dir: PathBuf,
        segment_count: u64,
        start: Option<WalPointer>,
        end: Option<WalPointer>,
    ) -> Result<Self, WalError> {
        let archived = segment::scan_archive(&archive_dir)?;
        let earliest = archived.first().map(|(index, _)| *index);

        let start_index = match (start, earliest) {
            (Some(ptr), Some(min)) if ptr.segment_index() < min => {
                return Err(WalError::HistoryTruncated {
                    requested: ptr.segment_index(),
                    earliest: min,
                });
            }
            (Some(ptr), _) => ptr.segment_index(),
            (None, Some(min)) => min,
            (None, None) => 0,
        };

        Ok(Self {
            codec,
            archiver,
            work_dir,
            archive_dir,
            segment_count,
            start,
            end_index: end.map(|ptr| ptr.segment_index()),
            cur_index: start_index,
            current: None,
            finished: false,
        })
    }

    /// Opens segment `cur_index`, or reports that the log has no more
    /// segments to read.
    fn open_next(&mut self) -> Result<bool, WalError> {
        if let Some(end) = self.end_index {
            if self.cur_index > end {
                return Ok(false);
            }
        }
        if self.cur_index > self.archiver.current_index() {
            return Ok(false);
        }

        let from_archive = self
            .archiver
            .check_can_read_archive_or_reserve_work(self.cur_index);
        let pinned = !from_archive;

        let opened = self.open_at(from_archive);
        match opened {
            Ok(Some(segment)) => {
                self.current = Some(segment);
                Ok(true)
            }
            Ok(None) => {
                if pinned {
                    self.archiver.release_work(self.cur_index);
                }
                Ok(false)
            }
            Err(err) => {
                if pinned {
                    self.archiver.release_work(self.cur_index);
                }
                Err(err)
            }
        }
    }

    fn open_at(&mut self, from_archive: bool) -> Result<Option<OpenSegment>, WalError> {
        let path = if from_archive {
            match segment::find_segment_file(&self.archive_dir, self.cur_index)? {
                Some(path) => path,
                None => {
                    return Err(WalError::CorruptLog(format!(
                        "archived segment {} is missing from {}",
                        self.cur_index,
                        self.archive_dir.display()
                    )));
                }
            }
        } else {
            let slot = self.cur_index % self.segment_count;
            self.work_dir
                .join(segment::segment_file_name(slot, self.codec.version()))
        };

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !from_archive => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let version = match self.codec.decode_header_from(&mut reader, self.cur_index)? {
            // a formatted slot that was never written: the log ends here
            None => return Ok(None),
            Some(version) => version,
        };
        if version != self.codec.version() {
            return Err(WalError::UnsupportedVersion {
                segment: self.cur_index,
                found: version,
                expected: self.codec.version(),
            });
        }

        let mut offset = self.codec.header_size();
        if let Some(start) = self.start {
            if start.segment_index() == self.cur_index && start.file_offset() > offset {
                reader.seek(SeekFrom::Start(start.file_offset() as u64))?;
                offset = start.file_offset();
            }
        }

        Ok(Some(OpenSegment {
            reader,
            offset,
            pinned: !from_archive,
        }))
    }

    fn close_current(&mut self) {
        if let Some(segment) = self.current.take() {
            if segment.pinned {
                self.archiver.release_work(self.cur_index);
            }
        }
    }

    fn advance_segment(&mut self) {
        self.close_current();
        self.cur_index += 1;
    }

    fn finish(&mut self) {
        self.close_current();
        self.finished = true;
    }

    /// Whether a decode failure at the current position is part of the log's
    /// writable tail, where torn writes and stale ring-slot bytes are
    /// expected after a crash.
    fn at_tail(&self) -> bool {
        self.cur_index >= self.archiver.current_index()
    }
}

impl Iterator for WalReplay {
    type Item = Result<(WalPointer, WalRecord), WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finish();
                        return None;
                    }
                    Err(err) => {
                        let torn = matches!(
                            err,
                            WalError::TruncatedRecord { .. }
                                | WalError::CorruptRecord { .. }
                                | WalError::UnknownType { .. }
                                | WalError::CorruptLog(_)
                        );
                        if torn && self.at_tail() {
                            tracing::debug!(
                                segment = self.cur_index,
                                %err,
                                "replay stopped at unreadable tail segment"
                            );
                            self.finish();
                            return None;
                        }
                        self.finish();
                        return Some(Err(err));
                    }
                }
            }
            let Some(segment) = self.current.as_mut() else {
                continue;
            };

            match self
                .codec
                .decode_from(&mut segment.reader, self.cur_index, segment.offset)
            {
                Ok(ReadOutcome::Record(record)) => {
                    let size = self.codec.size(&record);
                    let pointer = WalPointer::new(self.cur_index, segment.offset, size);
                    segment.offset += size;
                    return Some(Ok((pointer, record)));
                }
                Ok(ReadOutcome::EndOfSegment) => {
                    self.advance_segment();
                }
                Err(WalError::TruncatedRecord { .. }) => {
                    // a torn tail reads as the end of its segment
                    self.advance_segment();
                }
                Err(err @ (WalError::CorruptRecord { .. } | WalError::UnknownType { .. })) => {
                    if self.at_tail() {
                        tracing::debug!(
                            segment = self.cur_index,
                            %err,
                            "replay stopped at log tail"
                        );
                        self.finish();
                        return None;
                    }
                    self.finish();
                    return Some(Err(err));
                }
                Err(err) => {
                    self.finish();
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for WalReplay {
    fn drop(&mut self) {
        self.close_current();
    }
}
