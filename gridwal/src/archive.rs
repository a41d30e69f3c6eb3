//! The segment archiver.
//!
//! One background worker moves filled work segments into the archive
//! directory and recycles their ring slot. All coordination between the
//! writer (rollover), replay (work-slot pins) and truncate (reservations)
//! goes through the archiver's single mutex and condvar.

use crate::error::WalError;
use crate::segment;
use crate::wal::WalMode;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

struct ArchiverState {
    /// Absolute index of the segment currently being written.
    current: u64,
    /// Next absolute index to archive. Archival is strictly sequential from
    /// zero, so this equals `last_archived + 1` and the count of archived
    /// segments.
    watermark: u64,
    /// Truncate reservations, keyed by absolute index.
    reserved: BTreeMap<u64, u64>,
    /// Work-slot pins held by replay, keyed by absolute index.
    locked: BTreeMap<u64, u64>,
    /// Sticky worker failure, rethrown to rollover callers.
    failure: Option<String>,
    stopped: bool,
}

pub(crate) struct SegmentArchiver {
    state: Mutex<ArchiverState>,
    cv: Condvar,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    segment_count: u64,
    segment_size: u64,
    mode: WalMode,
    codec_version: u16,
}

impl SegmentArchiver {
    pub(crate) fn new(
        work_dir: PathBuf,
        archive_dir: PathBuf,
        segment_count: u64,
        segment_size: u64,
        mode: WalMode,
        codec_version: u16,
        watermark: u64,
        current: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ArchiverState {
                current,
                watermark,
                reserved: BTreeMap::new(),
                locked: BTreeMap::new(),
                failure: None,
                stopped: false,
            }),
            cv: Condvar::new(),
            work_dir,
            archive_dir,
            segment_count,
            segment_size,
            mode,
            codec_version,
        })
    }

    pub(crate) fn current_index(&self) -> u64 {
        self.state.lock().current
    }

    /// Largest absolute index whose archive file is fully present.
    pub(crate) fn last_archived(&self) -> Option<u64> {
        self.state.lock().watermark.checked_sub(1)
    }

    /// Repositions the writer, as part of `resume_logging`.
    pub(crate) fn set_current(&self, index: u64) {
        let mut state = self.state.lock();
        state.current = index;
        self.cv.notify_all();
    }

    /// Advances to the next absolute index at rollover. Blocks while the
    /// archiver is more than `segment_count` segments behind, since the next
    /// ring slot would still hold an unarchived segment.
    pub(crate) fn next_absolute_index(&self) -> Result<u64, WalError> {
        let mut state = self.state.lock();
        state.current += 1;
        let next = state.current;
        loop {
            if let Some(message) = &state.failure {
                return Err(WalError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("archiver failed: {message}"),
                )));
            }
            if state.stopped {
                return Err(WalError::Closed);
            }
            if next < state.watermark + self.segment_count {
                break;
            }
            self.cv.wait(&mut state);
        }
        self.cv.notify_all();
        Ok(next)
    }

    /// Resolves where replay should read segment `abs` from. `true` means
    /// the archive; `false` means the work slot, now pinned against
    /// re-formatting until `release_work`.
    pub(crate) fn check_can_read_archive_or_reserve_work(&self, abs: u64) -> bool {
        let mut state = self.state.lock();
        if abs < state.watermark {
            return true;
        }
        *state.locked.entry(abs).or_insert(0) += 1;
        false
    }

    pub(crate) fn release_work(&self, abs: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.locked.get_mut(&abs) {
            *count -= 1;
            if *count == 0 {
                state.locked.remove(&abs);
            }
        }
        self.cv.notify_all();
    }

    /// Pins `abs` (and everything above it) against truncate.
    pub(crate) fn reserve(&self, abs: u64) {
        let mut state = self.state.lock();
        *state.reserved.entry(abs).or_insert(0) += 1;
    }

    pub(crate) fn release(&self, abs: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.reserved.get_mut(&abs) {
            *count -= 1;
            if *count == 0 {
                state.reserved.remove(&abs);
            }
        }
    }

    /// Whether truncate must keep segment `abs`: at or above the smallest
    /// reserved index, or its work slot is pinned by a replay.
    pub(crate) fn reserved_for_truncate(&self, abs: u64) -> bool {
        let state = self.state.lock();
        if state.locked.contains_key(&abs) {
            return true;
        }
        match state.reserved.keys().next() {
            Some(&smallest) => abs >= smallest,
            None => false,
        }
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.cv.notify_all();
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let archiver = Arc::clone(self);
        std::thread::spawn(move || archiver.run())
    }

    fn run(&self) {
        tracing::debug!("segment archiver started");
        if let Err(err) = self.preallocate_work_slots() {
            self.record_failure(err);
            return;
        }
        loop {
            let to_archive = {
                let mut state = self.state.lock();
                loop {
                    if state.stopped {
                        tracing::debug!("segment archiver stopped");
                        return;
                    }
                    if state.watermark < state.current {
                        break state.watermark;
                    }
                    self.cv.wait(&mut state);
                }
            };

            if let Err(err) = self.archive_one(to_archive) {
                self.record_failure(err);
                return;
            }

            // the work slot cannot be recycled while a replay reads it
            {
                let mut state = self.state.lock();
                while state.locked.contains_key(&to_archive) && !state.stopped {
                    self.cv.wait(&mut state);
                }
                if state.stopped {
                    tracing::debug!("segment archiver stopped");
                    return;
                }
            }

            if let Err(err) = self.format_slot(to_archive) {
                self.record_failure(err);
                return;
            }

            {
                let mut state = self.state.lock();
                state.watermark = to_archive + 1;
                self.cv.notify_all();
            }
            tracing::debug!(segment = to_archive, "archived segment");
        }
    }

    /// Copies `work/<slot>` to its final archive name through a `.tmp` file.
    /// Restart-safe: a partially copied `.tmp` is simply overwritten.
    fn archive_one(&self, abs: u64) -> Result<(), WalError> {
        let slot = abs % self.segment_count;
        let source = self
            .work_dir
            .join(segment::segment_file_name(slot, self.codec_version));
        let final_name = segment::segment_file_name(abs, self.codec_version);
        let tmp = self
            .archive_dir
            .join(format!("{final_name}{}", segment::TMP_SUFFIX));

        fs::copy(&source, &tmp)?;
        if self.mode.fsyncs() {
            fs::File::open(&tmp)?.sync_data()?;
        }
        fs::rename(&tmp, self.archive_dir.join(final_name))?;
        Ok(())
    }

    fn format_slot(&self, abs: u64) -> Result<(), WalError> {
        let slot = abs % self.segment_count;
        let path = self
            .work_dir
            .join(segment::segment_file_name(slot, self.codec_version));
        segment::format_existing(&path, self.segment_size, self.mode.preallocates())
    }

    /// Fills out the work ring on startup so later rollovers never wait for
    /// file creation. Pre-allocated segments only exist in `Fsync` mode;
    /// other modes create slots on demand.
    fn preallocate_work_slots(&self) -> Result<(), WalError> {
        if !self.mode.preallocates() {
            return Ok(());
        }
        for slot in 0..self.segment_count {
            let path = self
                .work_dir
                .join(segment::segment_file_name(slot, self.codec_version));
            if !path.exists() {
                segment::SegmentFile::create_and_format(&path, self.segment_size, true)?;
                tracing::debug!(slot, "pre-allocated work segment");
            }
        }
        Ok(())
    }

    fn record_failure(&self, err: WalError) {
        tracing::error!(%err, "segment archiver failed");
        let mut state = self.state.lock();
        state.failure = Some(err.to_string());
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn archiver(segment_count: u64, watermark: u64, current: u64) -> Arc<SegmentArchiver> {
        let dir = TempDir::new().unwrap();
        SegmentArchiver::new(
            dir.path().join("work"),
            dir.path().join("archive"),
            segment_count,
            1024,
            WalMode::LogOnly,
            1,
            watermark,
            current,
        )
    }

    #[test]
    fn test_next_absolute_index_advances() {
        let archiver = archiver(4, 0, 0);
        assert_eq!(archiver.next_absolute_index().unwrap(), 1);
        assert_eq!(archiver.next_absolute_index().unwrap(), 2);
        assert_eq!(archiver.current_index(), 2);
    }

    #[test]
    fn test_next_absolute_index_blocks_on_full_ring() {
        let archiver = archiver(2, 0, 1);
        let blocked = Arc::new(AtomicBool::new(true));

        let waiter = {
            let archiver = Arc::clone(&archiver);
            let blocked = Arc::clone(&blocked);
            std::thread::spawn(move || {
                // 2 - last_archived(-1) > 2: must wait for the archiver
                let next = archiver.next_absolute_index();
                blocked.store(false, Ordering::SeqCst);
                next
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(blocked.load(Ordering::SeqCst));

        // simulate the worker publishing segment 0
        {
            let mut state = archiver.state.lock();
            state.watermark = 1;
            archiver.cv.notify_all();
        }
        let next = waiter.join().unwrap().unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_read_resolution_and_pins() {
        let archiver = archiver(4, 3, 5);

        assert!(archiver.check_can_read_archive_or_reserve_work(2));
        assert!(!archiver.check_can_read_archive_or_reserve_work(4));
        assert!(archiver.reserved_for_truncate(4));
        archiver.release_work(4);
        assert!(!archiver.reserved_for_truncate(4));
    }

    #[test]
    fn test_reservations_block_everything_above() {
        let archiver = archiver(4, 10, 12);

        archiver.reserve(5);
        assert!(!archiver.reserved_for_truncate(4));
        assert!(archiver.reserved_for_truncate(5));
        assert!(archiver.reserved_for_truncate(9));

        archiver.reserve(5);
        archiver.release(5);
        assert!(archiver.reserved_for_truncate(5));
        archiver.release(5);
        assert!(!archiver.reserved_for_truncate(5));
    }

    #[test]
    fn test_stop_unblocks_rollover() {
        let archiver = archiver(2, 0, 1);
        let waiter = {
            let archiver = Arc::clone(&archiver);
            std::thread::spawn(move || archiver.next_absolute_index())
        };
        std::thread::sleep(Duration::from_millis(50));
        archiver.stop();
        assert!(matches!(waiter.join().unwrap(), Err(WalError::Closed)));
    }

    #[test]
    fn test_archive_one_copies_and_renames() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        let archive = dir.path().join("archive");
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&archive).unwrap();

        let archiver = SegmentArchiver::new(
            work.clone(),
            archive.clone(),
            2,
            1024,
            WalMode::LogOnly,
            1,
            0,
            1,
        );

        // segment 0 lives in slot 0
        fs::write(work.join(segment::segment_file_name(0, 1)), b"segment zero").unwrap();
        archiver.archive_one(0).unwrap();

        let archived = archive.join(segment::segment_file_name(0, 1));
        assert_eq!(fs::read(&archived).unwrap(), b"segment zero");
        assert!(segment::scan_archive(&archive).unwrap().len() == 1);

        // archiving again is idempotent
        archiver.archive_one(0).unwrap();
        assert_eq!(fs::read(&archived).unwrap(), b"segment zero");
    }
}
