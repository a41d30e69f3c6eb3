//! The active write handle: the tail segment of the log.
//!
//! Producers reserve their record's file offset with one CAS on a packed
//! `(next_position, chain_size)` word, encode the record for that exact
//! position, and publish the bytes through a pending map. A second CAS that
//! zeroes `chain_size` freezes the chain: exactly one producer wins the
//! frozen interval and drains it to disk with a single `write_at`. Only the
//! write itself is serialized; reservation and encoding run concurrently.

use crate::error::WalError;
use crate::pointer::WalPointer;
use crate::record::{RecordCodec, WalRecord, SWITCH_SEGMENT_TAG};
use crate::segment::SegmentFile;
use crate::wal::{FailureHandler, WalMode};
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Position marker installed by `seal`; every append attempted after
/// sealing reports a required rollover. `append` never reserves an offset
/// ending past `u32::MAX - 1`, so the marker cannot collide with a real
/// position even in a 4 GiB segment.
const SEALED_POSITION: u32 = u32::MAX;

/// Result of an append attempt against one handle.
pub(crate) enum AppendOutcome {
    Appended(WalPointer),
    RolloverRequired,
}

struct FileState {
    segment: SegmentFile,
    /// Bytes of the segment known to be in the OS file.
    written: u32,
    /// High-water mark of forced bytes (`Fsync` mode only).
    last_fsync: u32,
    fsync_in_progress: bool,
}

pub(crate) struct FileWriteHandle {
    segment_index: u64,
    mode: WalMode,
    segment_size: u64,
    flush_threshold: u32,
    fsync_delay: Duration,
    codec: Arc<RecordCodec>,
    failure: Arc<dyn FailureHandler>,

    /// Packs `(next_position: u32, chain_size: u32)`.
    head: AtomicU64,
    state: AtomicU8,
    poisoned: AtomicBool,

    /// Encoded records reserved but not yet drained, keyed by file offset.
    pending: Mutex<BTreeMap<u32, Bytes>>,
    pending_cv: Condvar,

    file: Mutex<FileState>,
    written_cv: Condvar,
}

fn pack(position: u32, chain_size: u32) -> u64 {
    ((position as u64) << 32) | chain_size as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl FileWriteHandle {
    /// Wraps an opened segment. At `start_position == 0` the segment header
    /// is written eagerly so the file is replayable from its first byte.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        segment_index: u64,
        mut segment: SegmentFile,
        start_position: u32,
        mode: WalMode,
        segment_size: u64,
        flush_threshold: u32,
        fsync_delay: Duration,
        codec: Arc<RecordCodec>,
        failure: Arc<dyn FailureHandler>,
    ) -> Result<Arc<Self>, WalError> {
        let mut written = start_position;
        if start_position == 0 {
            let mut header = BytesMut::with_capacity(codec.header_size() as usize);
            codec.encode_header_into(&mut header);
            segment.write_at(0, &header)?;
            written = codec.header_size();
        }
        Ok(Arc::new(Self {
            segment_index,
            mode,
            segment_size,
            flush_threshold,
            fsync_delay,
            codec,
            failure,
            head: AtomicU64::new(pack(written, 0)),
            state: AtomicU8::new(STATE_OPEN),
            poisoned: AtomicBool::new(false),
            pending: Mutex::new(BTreeMap::new()),
            pending_cv: Condvar::new(),
            file: Mutex::new(FileState {
                segment,
                written,
                last_fsync: 0,
                fsync_in_progress: false,
            }),
            written_cv: Condvar::new(),
        }))
    }

    pub(crate) fn segment_index(&self) -> u64 {
        self.segment_index
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Reserves an offset for `record` and publishes its encoded bytes.
    /// Never blocks on I/O; a full (or sealed) segment reports
    /// `RolloverRequired` instead.
    pub(crate) fn append(&self, record: &WalRecord) -> Result<AppendOutcome, WalError> {
        if self.is_poisoned() {
            return Err(WalError::Poisoned);
        }
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Ok(AppendOutcome::RolloverRequired);
        }

        let size = self.codec.size(record);
        let mut cur = self.head.load(Ordering::Acquire);
        let position = loop {
            let (position, chain) = unpack(cur);
            let next = position as u64 + size as u64;
            if next >= self.segment_size || next >= SEALED_POSITION as u64 {
                return Ok(AppendOutcome::RolloverRequired);
            }
            match self.head.compare_exchange_weak(
                cur,
                pack(position + size, chain + size),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break position,
                Err(actual) => cur = actual,
            }
        };

        let mut buf = BytesMut::with_capacity(size as usize);
        self.codec
            .encode_into(record, self.segment_index, position, &mut buf);
        {
            let mut pending = self.pending.lock();
            pending.insert(position, buf.freeze());
            self.pending_cv.notify_all();
        }

        let (_, chain) = unpack(self.head.load(Ordering::Acquire));
        if chain > self.flush_threshold {
            self.drain_frozen(self.freeze_chain())?;
        }

        Ok(AppendOutcome::Appended(WalPointer::new(
            self.segment_index,
            position,
            size,
        )))
    }

    /// Blocks until the requested pointer (or everything appended so far,
    /// for `None`) is written to the file.
    pub(crate) fn flush(&self, upto: Option<WalPointer>) -> Result<(), WalError> {
        let target = match upto {
            Some(ptr) if ptr.segment_index() < self.segment_index => return Ok(()),
            Some(ptr) => ptr.end_offset(),
            None => {
                let (position, _) = unpack(self.head.load(Ordering::Acquire));
                if position == SEALED_POSITION {
                    // sealed by close(); everything was drained there
                    return Ok(());
                }
                position
            }
        };

        loop {
            if self.file.lock().written >= target {
                return Ok(());
            }
            if self.is_poisoned() {
                return Err(WalError::Poisoned);
            }
            match self.freeze_chain() {
                Some(interval) => self.drain_frozen(Some(interval))?,
                None => {
                    // a competing drainer owns the frozen bytes
                    let mut fs = self.file.lock();
                    if fs.written < target && !self.is_poisoned() {
                        self.written_cv.wait(&mut fs);
                    }
                }
            }
        }
    }

    /// As `flush`, plus a `force()` in `Fsync` mode. The configured fsync
    /// delay opens a short window for concurrent callers to share one force.
    pub(crate) fn fsync(&self, upto: Option<WalPointer>) -> Result<(), WalError> {
        if let Some(ptr) = upto {
            if ptr.segment_index() < self.segment_index {
                return Ok(());
            }
        }
        self.flush(upto)?;
        if !self.mode.fsyncs() {
            return Ok(());
        }

        let mut fs = self.file.lock();
        let target = match upto {
            Some(ptr) => ptr.end_offset(),
            None => fs.written,
        };
        while fs.last_fsync < target {
            if self.is_poisoned() {
                return Err(WalError::Poisoned);
            }
            if fs.fsync_in_progress {
                self.written_cv.wait(&mut fs);
                continue;
            }
            fs.fsync_in_progress = true;
            if !self.fsync_delay.is_zero() {
                let _ = self.written_cv.wait_for(&mut fs, self.fsync_delay);
            }
            let high = fs.written;
            let result = fs.segment.force();
            fs.fsync_in_progress = false;
            match result {
                Ok(()) => {
                    fs.last_fsync = high;
                    self.written_cv.notify_all();
                }
                Err(err) => {
                    drop(fs);
                    self.poison(&err);
                    return Err(WalError::Poisoned);
                }
            }
        }
        Ok(())
    }

    /// Closes the handle. Returns `true` iff this call performed the close.
    /// A rollover close writes the switch-segment marker and forces in
    /// `Fsync` mode before releasing the file.
    pub(crate) fn close(&self, rollover: bool) -> Result<bool, WalError> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.close_inner(rollover);
        self.state.store(STATE_CLOSED, Ordering::Release);
        result.map(|_| true)
    }

    fn close_inner(&self, rollover: bool) -> Result<(), WalError> {
        let sealed = self.seal();

        let mut fs = self.file.lock();
        if let Ok(final_position) = &sealed {
            while fs.written < *final_position && !self.is_poisoned() {
                self.written_cv.wait(&mut fs);
            }
        }

        let mut tail_result = Ok(());
        if !self.is_poisoned() && self.mode.fsyncs() {
            if rollover && (fs.written as u64) < self.segment_size {
                let write_pos = fs.written as u64;
                match fs.segment.write_at(write_pos, &[SWITCH_SEGMENT_TAG]) {
                    Ok(()) => fs.written += 1,
                    Err(err) => tail_result = Err(err),
                }
            }
            if tail_result.is_ok() {
                tail_result = fs.segment.force();
            }
            if tail_result.is_ok() {
                fs.last_fsync = fs.written;
            }
        }
        let close_result = fs.segment.close();
        self.written_cv.notify_all();
        drop(fs);

        if let Err(err) = &tail_result {
            self.poison(err);
        }

        sealed?;
        tail_result?;
        close_result
    }

    /// Drains until the chain is empty, then installs the sealed position so
    /// no further offset can be reserved. Returns the final position.
    fn seal(&self) -> Result<u32, WalError> {
        loop {
            if let Some(interval) = self.freeze_chain() {
                self.drain_frozen(Some(interval))?;
                continue;
            }
            let cur = self.head.load(Ordering::Acquire);
            let (position, chain) = unpack(cur);
            if chain != 0 {
                continue;
            }
            if self
                .head
                .compare_exchange(cur, pack(SEALED_POSITION, 0), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(position);
            }
        }
    }

    /// Freezes the current chain, returning the interval `[begin, end)` this
    /// caller now owns, or `None` when there is nothing to drain.
    fn freeze_chain(&self) -> Option<(u32, u32)> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (position, chain) = unpack(cur);
            if chain == 0 {
                return None;
            }
            match self.head.compare_exchange_weak(
                cur,
                pack(position, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((position - chain, position)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Assembles the frozen interval oldest-to-newest and writes it with one
    /// `write_at`. Drainers write in offset order: a later interval waits
    /// until `written` reaches its begin position.
    fn drain_frozen(&self, interval: Option<(u32, u32)>) -> Result<(), WalError> {
        let Some((begin, end)) = interval else {
            return Ok(());
        };

        let mut buf = BytesMut::with_capacity((end - begin) as usize);
        {
            let mut pending = self.pending.lock();
            let mut next = begin;
            while next < end {
                if self.is_poisoned() {
                    return Err(WalError::Poisoned);
                }
                match pending.remove(&next) {
                    Some(bytes) => {
                        next += bytes.len() as u32;
                        buf.extend_from_slice(&bytes);
                    }
                    // reserved but not yet published; the producer is mid-encode
                    None => self.pending_cv.wait(&mut pending),
                }
            }
        }

        let mut fs = self.file.lock();
        while fs.written != begin {
            if self.is_poisoned() {
                return Err(WalError::Poisoned);
            }
            self.written_cv.wait(&mut fs);
        }
        match fs.segment.write_at(begin as u64, &buf) {
            Ok(()) => {
                fs.written = end;
                self.written_cv.notify_all();
                Ok(())
            }
            Err(err) => {
                drop(fs);
                self.poison(&err);
                Err(WalError::Poisoned)
            }
        }
    }

    /// Marks the handle unusable after an I/O failure. The failure handler
    /// fires exactly once; all waiters are woken so they observe the flag.
    pub(crate) fn poison(&self, error: &WalError) {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            tracing::error!(
                segment = self.segment_index,
                %error,
                "write-ahead log I/O failure; refusing further writes"
            );
            self.failure.on_failure(error);
        }
        let fs = self.file.lock();
        self.written_cv.notify_all();
        drop(fs);
        let pending = self.pending.lock();
        self.pending_cv.notify_all();
        drop(pending);
    }

    #[cfg(test)]
    fn written(&self) -> u32 {
        self.file.lock().written
    }
}
