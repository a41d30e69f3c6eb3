//! The WAL manager: lifecycle, configuration and the public API.

use crate::archive::SegmentArchiver;
use crate::error::WalError;
use crate::handle::{AppendOutcome, FileWriteHandle};
use crate::pointer::WalPointer;
use crate::record::{ReadOutcome, RecordCodec, WalRecord};
use crate::replay::WalReplay;
use crate::segment;
use crate::{DEFAULT_BUFFER_BYTES, DEFAULT_SEGMENT_SIZE, DEFAULT_WAL_SEGMENTS};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Durability mode of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalMode {
    /// Record writes are disabled; replay of existing segments still works.
    None,
    /// Batched writes, no fsync.
    LogOnly,
    /// Batched writes flushed by a background thread, no fsync.
    Background,
    /// The default: segments are pre-allocated by zero-fill and every
    /// user-initiated sync forces to the storage medium.
    #[default]
    Fsync,
}

impl WalMode {
    /// Whether `append` produces records at all.
    pub fn writes_records(&self) -> bool {
        !matches!(self, WalMode::None)
    }

    /// Whether segment files are zero-filled to their full size at creation.
    pub fn preallocates(&self) -> bool {
        matches!(self, WalMode::Fsync)
    }

    /// Whether `fsync` actually forces to the storage medium.
    pub fn fsyncs(&self) -> bool {
        matches!(self, WalMode::Fsync)
    }

    /// Whether a background flusher thread runs.
    pub fn background_flush(&self) -> bool {
        matches!(self, WalMode::Background)
    }
}

/// WAL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Root of the work directories; the ring lives in
    /// `<work_root>/<consistent_id>/`.
    pub work_root: PathBuf,
    /// Root of the archive directories; retired segments live in
    /// `<archive_root>/<consistent_id>/`.
    pub archive_root: PathBuf,
    /// Node identity used to namespace the on-disk directories.
    pub consistent_id: String,
    /// Durability mode.
    pub mode: WalMode,
    /// Fixed byte size of each segment; a power of two up to 4 GiB.
    pub segment_size: u64,
    /// Number of ring slots in the work directory.
    pub wal_segments: u64,
    /// Background flusher interval (`Background` mode only).
    pub flush_frequency_ms: u64,
    /// Coalescing window for fsync (`Fsync` mode only).
    pub fsync_delay_ns: u64,
    /// Chain size above which a producer drains the pending records.
    pub thread_local_buffer_bytes: u32,
    /// Reserved for page-aligned hosts; does not change the framing.
    pub always_write_full_pages: bool,
}

impl WalConfig {
    pub fn new(
        work_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
        consistent_id: impl Into<String>,
    ) -> Self {
        Self {
            work_root: work_root.into(),
            archive_root: archive_root.into(),
            consistent_id: consistent_id.into(),
            mode: WalMode::default(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            wal_segments: DEFAULT_WAL_SEGMENTS,
            flush_frequency_ms: 500,
            fsync_delay_ns: 1,
            thread_local_buffer_bytes: DEFAULT_BUFFER_BYTES,
            always_write_full_pages: false,
        }
    }

    pub fn with_mode(mut self, mode: WalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_wal_segments(mut self, count: u64) -> Self {
        self.wal_segments = count;
        self
    }

    pub fn with_flush_frequency_ms(mut self, millis: u64) -> Self {
        self.flush_frequency_ms = millis;
        self
    }

    pub fn with_fsync_delay_ns(mut self, nanos: u64) -> Self {
        self.fsync_delay_ns = nanos;
        self
    }

    pub fn with_thread_local_buffer_bytes(mut self, bytes: u32) -> Self {
        self.thread_local_buffer_bytes = bytes;
        self
    }

    /// Work directory of this node.
    pub fn work_dir(&self) -> PathBuf {
        self.work_root.join(&self.consistent_id)
    }

    /// Archive directory of this node.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_root.join(&self.consistent_id)
    }

    fn validate(&self) -> Result<(), WalError> {
        if self.consistent_id.is_empty() {
            return Err(WalError::InvalidConfig("consistent_id is empty".into()));
        }
        if !self.segment_size.is_power_of_two() {
            return Err(WalError::InvalidConfig(format!(
                "segment_size {} is not a power of two",
                self.segment_size
            )));
        }
        if !(64..=4_u64 << 30).contains(&self.segment_size) {
            return Err(WalError::InvalidConfig(format!(
                "segment_size {} is out of range (64 bytes to 4 GiB)",
                self.segment_size
            )));
        }
        if self.wal_segments < 2 {
            return Err(WalError::InvalidConfig(format!(
                "wal_segments {} is below the minimum of 2",
                self.wal_segments
            )));
        }
        Ok(())
    }
}

/// Reporter for unrecoverable log failures.
///
/// Invoked exactly once when a drain, force or rollover hits an I/O error
/// and the log refuses further writes. Hosts that must not run without a
/// working log terminate the process here.
pub trait FailureHandler: Send + Sync {
    fn on_failure(&self, error: &WalError);
}

/// Default failure handler: logs the failure and leaves the decision to the
/// host.
pub struct LogFailureHandler;

impl FailureHandler for LogFailureHandler {
    fn on_failure(&self, error: &WalError) {
        tracing::error!(%error, "fatal write-ahead log failure");
    }
}

/// Counters describing WAL activity since `open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub records_appended: u64,
    pub bytes_appended: u64,
    pub fsyncs: u64,
    pub rollovers: u64,
    pub segments_archived: u64,
}

struct FlusherControl {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// The write-ahead log.
pub struct Wal {
    config: WalConfig,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    codec: Arc<RecordCodec>,
    archiver: Arc<SegmentArchiver>,
    failure: Arc<dyn FailureHandler>,

    current: Arc<Mutex<Option<Arc<FileWriteHandle>>>>,
    handle_cv: Condvar,

    archiver_worker: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flusher_control: Arc<FlusherControl>,
    closed: AtomicBool,

    stats_records: AtomicU64,
    stats_bytes: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_rollovers: AtomicU64,
}

impl Wal {
    /// Opens or creates a WAL with the default failure handler.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        Self::open_with(config, Arc::new(LogFailureHandler))
    }

    /// Opens or creates a WAL.
    ///
    /// Creates the work and archive directories, removes `.tmp` leftovers,
    /// recovers the archived watermark from the archive listing, validates
    /// the work ring, and pre-allocates the first segment of a fresh log.
    /// Logging itself starts with [`Wal::resume_logging`].
    pub fn open_with(
        config: WalConfig,
        failure: Arc<dyn FailureHandler>,
    ) -> Result<Self, WalError> {
        config.validate()?;
        let codec = Arc::new(RecordCodec::new());
        let work_dir = config.work_dir();
        let archive_dir = config.archive_dir();

        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&archive_dir)?;
        segment::remove_tmp_files(&work_dir)?;
        segment::remove_tmp_files(&archive_dir)?;

        let archived = segment::scan_archive(&archive_dir)?;
        let watermark = archived.last().map(|(index, _)| index + 1).unwrap_or(0);

        let work_files = validate_work_dir(&work_dir, &config)?;
        if work_files == 0 {
            let first = work_dir.join(segment::segment_file_name(0, codec.version()));
            segment::SegmentFile::create_and_format(
                &first,
                config.segment_size,
                config.mode.preallocates(),
            )?;
        }

        let current = discover_current(&work_dir, watermark, config.wal_segments, &codec);
        let archiver = SegmentArchiver::new(
            work_dir.clone(),
            archive_dir.clone(),
            config.wal_segments,
            config.segment_size,
            config.mode,
            codec.version(),
            watermark,
            current,
        );

        tracing::info!(
            work = %work_dir.display(),
            archive = %archive_dir.display(),
            mode = ?config.mode,
            segment = current,
            last_archived = ?watermark.checked_sub(1),
            "write-ahead log opened"
        );

        Ok(Self {
            config,
            work_dir,
            archive_dir,
            codec,
            archiver,
            failure,
            current: Arc::new(Mutex::new(None)),
            handle_cv: Condvar::new(),
            archiver_worker: Mutex::new(None),
            flusher: Mutex::new(None),
            flusher_control: Arc::new(FlusherControl {
                stop: Mutex::new(false),
                cv: Condvar::new(),
            }),
            closed: AtomicBool::new(false),
            stats_records: AtomicU64::new(0),
            stats_bytes: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_rollovers: AtomicU64::new(0),
        })
    }

    /// Installs the active write handle and starts the background workers.
    ///
    /// The handle is positioned just past `last_read`, so everything the
    /// host already consumed stays put and later bytes are overwritten.
    /// With no pointer, logging starts on a fresh segment.
    pub fn resume_logging(&self, last_read: Option<WalPointer>) -> Result<(), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        if !self.config.mode.writes_records() {
            tracing::info!("write-ahead log resumed with record writes disabled");
            return Ok(());
        }
        if self.current.lock().is_some() {
            return Err(WalError::InvalidState(
                "resume_logging was already called".into(),
            ));
        }

        let (index, position) = match last_read {
            Some(ptr) => (ptr.segment_index(), ptr.end_offset()),
            None => (self.archiver.current_index(), 0),
        };
        self.archiver.set_current(index);

        let slot = index % self.config.wal_segments;
        let path = self
            .work_dir
            .join(segment::segment_file_name(slot, self.codec.version()));
        if !path.exists() {
            segment::SegmentFile::create_and_format(
                &path,
                self.config.segment_size,
                self.config.mode.preallocates(),
            )?;
        }
        let file = segment::SegmentFile::open_rw(&path, position as u64)?;
        let handle = FileWriteHandle::create(
            index,
            file,
            position,
            self.config.mode,
            self.config.segment_size,
            self.config.thread_local_buffer_bytes,
            Duration::from_nanos(self.config.fsync_delay_ns),
            Arc::clone(&self.codec),
            Arc::clone(&self.failure),
        )?;

        {
            let mut current = self.current.lock();
            *current = Some(handle);
            self.handle_cv.notify_all();
        }

        *self.archiver_worker.lock() = Some(self.archiver.spawn_worker());
        if self.config.mode.background_flush() {
            *self.flusher.lock() = Some(self.spawn_flusher());
        }

        tracing::info!(segment = index, position, "write-ahead log resumed");
        Ok(())
    }

    /// Appends a record, rolling the active segment over as needed.
    ///
    /// Returns `None` only in [`WalMode::None`].
    pub fn append(&self, record: &WalRecord) -> Result<Option<WalPointer>, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        if !self.config.mode.writes_records() {
            return Ok(None);
        }

        let size = self.codec.size(record);
        if self.codec.header_size() as u64 + size as u64 >= self.config.segment_size {
            return Err(WalError::RecordTooLarge {
                size: size as usize,
                max: (self.config.segment_size - self.codec.header_size() as u64 - 1) as usize,
            });
        }

        loop {
            let handle = self.current_handle()?;
            match handle.append(record)? {
                AppendOutcome::Appended(pointer) => {
                    self.stats_records.fetch_add(1, Ordering::Relaxed);
                    self.stats_bytes.fetch_add(size as u64, Ordering::Relaxed);
                    return Ok(Some(pointer));
                }
                AppendOutcome::RolloverRequired => self.roll_over(&handle)?,
            }
        }
    }

    /// Blocks until the requested pointer (or everything appended so far)
    /// has been handed to the OS.
    pub fn flush(&self, up_to: Option<WalPointer>) -> Result<(), WalError> {
        if !self.config.mode.writes_records() {
            return Ok(());
        }
        self.current_handle()?.flush(up_to)
    }

    /// Waits for the write and, in `Fsync` mode, forces it to the medium.
    pub fn fsync(&self, up_to: Option<WalPointer>) -> Result<(), WalError> {
        if !self.config.mode.writes_records() {
            return Ok(());
        }
        self.current_handle()?.fsync(up_to)?;
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Replays records from `from` (or the earliest available segment).
    pub fn replay(&self, from: Option<WalPointer>) -> Result<WalReplay, WalError> {
        self.replay_bounded(from, None)
    }

    /// Replays records from `from` up to and including `to`'s segment.
    pub fn replay_bounded(
        &self,
        from: Option<WalPointer>,
        to: Option<WalPointer>,
    ) -> Result<WalReplay, WalError> {
        // make every returned append visible to the iterator
        let handle = self.current.lock().clone();
        if let Some(handle) = handle {
            if !handle.is_poisoned() {
                handle.flush(None)?;
            }
        }
        WalReplay::new(
            Arc::clone(&self.codec),
            Arc::clone(&self.archiver),
            self.work_dir.clone(),
            self.archive_dir.clone(),
            self.config.wal_segments,
            from,
            to,
        )
    }

    /// Pins the segment containing `pointer` against truncation. Returns
    /// whether the segment currently exists.
    pub fn reserve(&self, pointer: WalPointer) -> bool {
        let index = pointer.segment_index();
        self.archiver.reserve(index);
        if self.segment_exists(index) {
            true
        } else {
            self.archiver.release(index);
            false
        }
    }

    /// Releases one reservation of the segment containing `pointer`.
    pub fn release(&self, pointer: WalPointer) {
        self.archiver.release(pointer.segment_index());
    }

    /// Deletes archived segments no longer needed below `up_to`.
    ///
    /// Only files with `index + 1 < up_to.segment_index` are candidates;
    /// deletion stops at the first reserved or replay-pinned index, and the
    /// two newest archived segments always survive so the archived
    /// watermark can be recomputed from the directory alone.
    pub fn truncate(&self, up_to: WalPointer) -> Result<u64, WalError> {
        let archived = segment::scan_archive(&self.archive_dir)?;
        let last_archived = self.archiver.last_archived();
        let mut deleted = 0u64;

        for (index, path) in archived {
            if index + 1 >= up_to.segment_index() {
                break;
            }
            match last_archived {
                Some(last) if index + 2 <= last => {}
                _ => break,
            }
            if self.archiver.reserved_for_truncate(index) {
                break;
            }
            fs::remove_file(&path)?;
            tracing::info!(segment = index, "truncated archived segment");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Stops the workers, flushes and closes the active segment, and
    /// releases all files. Idempotent, and safe to call after a failure.
    pub fn close(&self) -> Result<(), WalError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut stop = self.flusher_control.stop.lock();
            *stop = true;
            self.flusher_control.cv.notify_all();
        }
        if let Some(worker) = self.flusher.lock().take() {
            let _ = worker.join();
        }

        let handle = {
            let current = self.current.lock();
            self.handle_cv.notify_all();
            current.clone()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.close(false) {
                tracing::warn!(%err, "error closing active segment");
            }
        }

        self.archiver.stop();
        if let Some(worker) = self.archiver_worker.lock().take() {
            let _ = worker.join();
        }

        tracing::info!("write-ahead log closed");
        Ok(())
    }

    /// Absolute index of the segment currently being written.
    pub fn current_segment_index(&self) -> u64 {
        self.archiver.current_index()
    }

    /// Largest absolute index whose archive file is fully present.
    pub fn last_archived_index(&self) -> Option<u64> {
        self.archiver.last_archived()
    }

    pub fn mode(&self) -> WalMode {
        self.config.mode
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            records_appended: self.stats_records.load(Ordering::Relaxed),
            bytes_appended: self.stats_bytes.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            rollovers: self.stats_rollovers.load(Ordering::Relaxed),
            segments_archived: self.archiver.last_archived().map_or(0, |index| index + 1),
        }
    }

    fn current_handle(&self) -> Result<Arc<FileWriteHandle>, WalError> {
        self.current
            .lock()
            .clone()
            .ok_or_else(|| WalError::InvalidState("resume_logging has not been called".into()))
    }

    /// Transitions to the next segment. The first producer to close the old
    /// handle performs the rollover; everyone else waits for the new handle.
    fn roll_over(&self, old: &Arc<FileWriteHandle>) -> Result<(), WalError> {
        let won = match old.close(true) {
            Ok(won) => won,
            Err(err) => {
                let current = self.current.lock();
                self.handle_cv.notify_all();
                drop(current);
                return Err(err);
            }
        };

        if won {
            let result = self.install_next_handle();
            if let Err(err) = &result {
                // a failed rollover is unrecoverable: poison the old handle
                // so waiting producers fail instead of hanging. A shutdown
                // race is not a failure, but the waiters still need waking.
                if !matches!(err, WalError::Closed) {
                    old.poison(err);
                }
                let current = self.current.lock();
                self.handle_cv.notify_all();
                drop(current);
            }
            result
        } else {
            let mut current = self.current.lock();
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(WalError::Closed);
                }
                match current.as_ref() {
                    Some(handle) if Arc::ptr_eq(handle, old) => {
                        if old.is_poisoned() {
                            return Err(WalError::Poisoned);
                        }
                        self.handle_cv.wait(&mut current);
                    }
                    _ => return Ok(()),
                }
            }
        }
    }

    fn install_next_handle(&self) -> Result<(), WalError> {
        let next = self.archiver.next_absolute_index()?;
        let slot = next % self.config.wal_segments;
        let path = self
            .work_dir
            .join(segment::segment_file_name(slot, self.codec.version()));
        if !path.exists() {
            segment::SegmentFile::create_and_format(
                &path,
                self.config.segment_size,
                self.config.mode.preallocates(),
            )?;
        }
        let file = segment::SegmentFile::open_rw(&path, 0)?;
        let handle = FileWriteHandle::create(
            next,
            file,
            0,
            self.config.mode,
            self.config.segment_size,
            self.config.thread_local_buffer_bytes,
            Duration::from_nanos(self.config.fsync_delay_ns),
            Arc::clone(&self.codec),
            Arc::clone(&self.failure),
        )?;

        {
            let mut current = self.current.lock();
            *current = Some(handle);
            self.handle_cv.notify_all();
        }
        self.stats_rollovers.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(segment = next, "rolled over to next segment");
        Ok(())
    }

    fn segment_exists(&self, index: u64) -> bool {
        match self.archiver.last_archived() {
            Some(last) if index <= last => segment::find_segment_file(&self.archive_dir, index)
                .ok()
                .flatten()
                .is_some(),
            _ => index <= self.archiver.current_index(),
        }
    }

    fn spawn_flusher(&self) -> JoinHandle<()> {
        let control = Arc::clone(&self.flusher_control);
        let current = Arc::clone(&self.current);
        let period = Duration::from_millis(self.config.flush_frequency_ms);
        std::thread::spawn(move || {
            loop {
                {
                    let mut stop = control.stop.lock();
                    if *stop {
                        break;
                    }
                    let _ = control.cv.wait_for(&mut stop, period);
                    if *stop {
                        break;
                    }
                }
                let handle = current.lock().clone();
                if let Some(handle) = handle {
                    if let Err(err) = handle.flush(None) {
                        tracing::warn!(%err, "background flush failed");
                        break;
                    }
                }
            }
            tracing::debug!("background flusher stopped");
        })
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Checks the work directory against the configured ring geometry. In
/// `Fsync` mode every pre-existing work file must have exactly the segment
/// size, since a short file voids the pre-allocation guarantee.
fn validate_work_dir(work_dir: &Path, config: &WalConfig) -> Result<usize, WalError> {
    let mut count = 0;
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((slot, _)) = segment::parse_segment_file_name(&name.to_string_lossy()) else {
            continue;
        };
        count += 1;
        if slot >= config.wal_segments {
            return Err(WalError::InvalidState(format!(
                "work file {} names slot {} but the ring only has {} slots",
                name.to_string_lossy(),
                slot,
                config.wal_segments
            )));
        }
        if config.mode.preallocates() {
            let len = entry.metadata()?.len();
            if len != config.segment_size {
                return Err(WalError::InvalidState(format!(
                    "work file {} has size {} but segments are {} bytes",
                    name.to_string_lossy(),
                    len,
                    config.segment_size
                )));
            }
        }
    }
    if count as u64 > config.wal_segments {
        return Err(WalError::InvalidState(format!(
            "work directory holds {} segments but the ring only has {} slots",
            count, config.wal_segments
        )));
    }
    Ok(count)
}

/// Probes the work ring for the segment being written before the last
/// shutdown. Starting at the archived watermark, a slot belongs to absolute
/// index `abs` iff its header parses and its first record's checksum
/// verifies at `abs` (the checksum binds the position, so bytes from an
/// earlier lap of the ring fail here).
fn discover_current(
    work_dir: &Path,
    watermark: u64,
    segment_count: u64,
    codec: &RecordCodec,
) -> u64 {
    let mut current = watermark;
    for abs in watermark..watermark + segment_count {
        let path = work_dir.join(segment::segment_file_name(abs % segment_count, codec.version()));
        let Ok(file) = File::open(&path) else {
            break;
        };
        let mut reader = BufReader::new(file);
        match codec.decode_header_from(&mut reader, abs) {
            Ok(Some(version)) if version == codec.version() => {}
            _ => break,
        }
        match codec.decode_from(&mut reader, abs, codec.header_size()) {
            Ok(ReadOutcome::Record(_)) => current = abs,
            Ok(ReadOutcome::EndOfSegment) => {
                // header-only segment: a fresh rollover target
                current = abs;
                break;
            }
            Err(_) => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path, mode: WalMode) -> WalConfig {
        WalConfig::new(dir.join("wal"), dir.join("wal-archive"), "node-1")
            .with_mode(mode)
            .with_segment_size(1024)
            .with_wal_segments(4)
    }

    fn collect(replay: WalReplay) -> Vec<(WalPointer, WalRecord)> {
        replay.map(|item| item.unwrap()).collect()
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::Fsync)).unwrap();
        wal.resume_logging(None).unwrap();

        let record = WalRecord::data(&b"first"[..]);
        let pointer = wal.append(&record).unwrap().unwrap();
        assert_eq!(pointer.segment_index(), 0);
        assert_eq!(pointer.file_offset(), 3);
        wal.fsync(Some(pointer)).unwrap();

        let records = collect(wal.replay(None).unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, pointer);
        assert_eq!(records[0].1, record);
        wal.close().unwrap();
    }

    #[test]
    fn test_replay_from_pointer() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        wal.resume_logging(None).unwrap();

        let mut pointers = Vec::new();
        for i in 0..5 {
            let record = WalRecord::data(format!("record-{i}").into_bytes());
            pointers.push(wal.append(&record).unwrap().unwrap());
        }

        let records = collect(wal.replay(Some(pointers[2])).unwrap());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, pointers[2]);
        wal.close().unwrap();
    }

    #[test]
    fn test_append_in_none_mode() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::None)).unwrap();
        wal.resume_logging(None).unwrap();

        assert!(wal.append(&WalRecord::data(&b"dropped"[..])).unwrap().is_none());
        wal.fsync(None).unwrap();

        let records = collect(wal.replay(None).unwrap());
        assert!(records.is_empty());
        wal.close().unwrap();
    }

    #[test]
    fn test_reopen_resumes_at_pointer() {
        let dir = TempDir::new().unwrap();

        let last = {
            let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
            wal.resume_logging(None).unwrap();
            let mut last = None;
            for i in 0..10 {
                let record = WalRecord::data(format!("pass-one-{i}").into_bytes());
                last = wal.append(&record).unwrap();
            }
            wal.fsync(None).unwrap();
            wal.close().unwrap();
            last.unwrap()
        };

        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        assert_eq!(wal.current_segment_index(), last.segment_index());
        wal.resume_logging(Some(last)).unwrap();

        let next = wal.append(&WalRecord::data(&b"pass-two"[..])).unwrap().unwrap();
        assert_eq!(next.file_offset(), last.end_offset());

        let records = collect(wal.replay(None).unwrap());
        assert_eq!(records.len(), 11);
        wal.close().unwrap();
    }

    #[test]
    fn test_rollover_and_archive() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), WalMode::LogOnly).with_segment_size(64);
        let wal = Wal::open(config).unwrap();
        wal.resume_logging(None).unwrap();

        // 20-byte records: three per segment
        for i in 0..12 {
            let record = WalRecord::data(format!("rec{i:08}").into_bytes());
            wal.append(&record).unwrap().unwrap();
        }
        assert_eq!(wal.current_segment_index(), 3);

        // the archiver retires the filled segments
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while wal.last_archived_index() < Some(2) {
            assert!(std::time::Instant::now() < deadline, "archiver fell behind");
            std::thread::sleep(Duration::from_millis(10));
        }

        let records = collect(wal.replay(None).unwrap());
        assert_eq!(records.len(), 12);
        assert_eq!(wal.stats().rollovers, 3);
        wal.close().unwrap();
    }

    #[test]
    fn test_record_too_large() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        wal.resume_logging(None).unwrap();

        let record = WalRecord::data(vec![0u8; 2048]);
        assert!(matches!(
            wal.append(&record),
            Err(WalError::RecordTooLarge { .. })
        ));
        wal.close().unwrap();
    }

    #[test]
    fn test_append_before_resume_fails() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        assert!(matches!(
            wal.append(&WalRecord::data(&b"early"[..])),
            Err(WalError::InvalidState(_))
        ));
        wal.close().unwrap();
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        wal.resume_logging(None).unwrap();
        wal.close().unwrap();
        assert!(matches!(
            wal.append(&WalRecord::data(&b"late"[..])),
            Err(WalError::Closed)
        ));
    }

    #[test]
    fn test_background_mode_flushes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), WalMode::Background).with_flush_frequency_ms(20);
        let wal = Wal::open(config).unwrap();
        wal.resume_logging(None).unwrap();

        let pointer = wal
            .append(&WalRecord::data(&b"flushed in the background"[..]))
            .unwrap()
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let path = dir
                .path()
                .join("wal")
                .join("node-1")
                .join(segment::segment_file_name(0, 1));
            if fs::metadata(&path).map(|m| m.len()).unwrap_or(0) >= pointer.end_offset() as u64 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "flusher never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        wal.close().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), WalMode::LogOnly).with_segment_size(1000);
        assert!(matches!(
            Wal::open(config),
            Err(WalError::InvalidConfig(_))
        ));

        let config = test_config(dir.path(), WalMode::LogOnly).with_wal_segments(1);
        assert!(matches!(
            Wal::open(config),
            Err(WalError::InvalidConfig(_))
        ));

        let config = test_config(dir.path(), WalMode::LogOnly).with_segment_size(8_u64 << 30);
        assert!(matches!(
            Wal::open(config),
            Err(WalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_four_gib_segments_accepted() {
        // 4 GiB is the largest size whose offsets fit a pointer; without
        // pre-allocation the segment file stays empty
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), WalMode::LogOnly).with_segment_size(4_u64 << 30);
        let wal = Wal::open(config).unwrap();
        wal.resume_logging(None).unwrap();

        let pointer = wal
            .append(&WalRecord::data(&b"fits"[..]))
            .unwrap()
            .unwrap();
        assert_eq!(pointer.file_offset(), 3);
        wal.close().unwrap();
    }

    #[test]
    fn test_fsync_mode_rejects_short_work_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), WalMode::Fsync);
        let work_dir = config.work_dir();
        fs::create_dir_all(&work_dir).unwrap();
        fs::write(work_dir.join(segment::segment_file_name(0, 1)), b"short").unwrap();

        assert!(matches!(
            Wal::open(config),
            Err(WalError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reserve_missing_segment() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path(), WalMode::LogOnly)).unwrap();
        wal.resume_logging(None).unwrap();

        assert!(wal.reserve(WalPointer::new(0, 0, 0)));
        wal.release(WalPointer::new(0, 0, 0));
        assert!(!wal.reserve(WalPointer::new(99, 0, 0)));
        wal.close().unwrap();
    }
}
