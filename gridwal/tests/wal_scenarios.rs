//! End-to-end scenarios exercising rollover, archival, reservations, crash
//! tails and concurrent producers together.

use gridwal::{Wal, WalConfig, WalMode, WalPointer, WalRecord};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(dir: &Path, mode: WalMode, segment_size: u64, segments: u64) -> WalConfig {
    WalConfig::new(dir.join("wal"), dir.join("wal-archive"), "node-1")
        .with_mode(mode)
        .with_segment_size(segment_size)
        .with_wal_segments(segments)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn collect(wal: &Wal, from: Option<WalPointer>) -> Vec<(WalPointer, WalRecord)> {
    wal.replay(from)
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
}

#[test]
fn fresh_start_single_append() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(config(dir.path(), WalMode::Fsync, 1024, 4)).unwrap();
    wal.resume_logging(None).unwrap();

    // one payload byte plus 9 bytes of framing, landing just after the
    // 3-byte segment header
    let record = WalRecord::data(&b"x"[..]);
    let pointer = wal.append(&record).unwrap().unwrap();
    assert_eq!(pointer, WalPointer::new(0, 3, 10));
    wal.fsync(Some(pointer)).unwrap();

    let records = collect(&wal, None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, pointer);
    assert_eq!(records[0].1, record);
    wal.close().unwrap();
}

#[test]
fn rollover_assigns_exact_offsets() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 64, 2)).unwrap();
    wal.resume_logging(None).unwrap();

    // 20-byte records against 64-byte segments: three fit after the header,
    // the fourth rolls over
    let mut pointers = Vec::new();
    for i in 0..5 {
        let record = WalRecord::data(format!("record-{i:04}").into_bytes());
        pointers.push(wal.append(&record).unwrap().unwrap());
    }

    let expected = [
        WalPointer::new(0, 3, 20),
        WalPointer::new(0, 23, 20),
        WalPointer::new(0, 43, 20),
        WalPointer::new(1, 3, 20),
        WalPointer::new(1, 23, 20),
    ];
    assert_eq!(pointers, expected);

    wait_until("segment 0 to be archived", || {
        wal.last_archived_index() == Some(0)
    });

    let records = collect(&wal, None);
    assert_eq!(records.len(), 5);
    for (found, expected) in records.iter().zip(&pointers) {
        assert_eq!(found.0, *expected);
    }
    wal.close().unwrap();
}

#[test]
fn reservation_blocks_truncate() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 64, 4)).unwrap();
    wal.resume_logging(None).unwrap();

    // three records per segment; twenty segments in total
    for i in 0..60 {
        let record = WalRecord::data(format!("record-{i:04}").into_bytes());
        wal.append(&record).unwrap().unwrap();
    }
    assert_eq!(wal.current_segment_index(), 19);
    wait_until("the archiver to catch up", || {
        wal.last_archived_index() == Some(18)
    });

    assert!(wal.reserve(WalPointer::new(5, 0, 0)));

    // candidates are indices below 14; the reservation stops deletion at 5
    let deleted = wal.truncate(WalPointer::new(15, 0, 0)).unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(archived_indices(dir.path()), (5..=18).collect::<Vec<_>>());

    wal.release(WalPointer::new(5, 0, 0));
    let deleted = wal.truncate(WalPointer::new(15, 0, 0)).unwrap();
    assert_eq!(deleted, 9);
    assert_eq!(archived_indices(dir.path()), (14..=18).collect::<Vec<_>>());

    wal.close().unwrap();
}

fn archived_indices(dir: &Path) -> Vec<u64> {
    let archive_dir = dir.join("wal-archive").join("node-1");
    let mut indices: Vec<u64> = std::fs::read_dir(archive_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter_map(|name| gridwal::segment::parse_segment_file_name(&name))
        .map(|(index, _)| index)
        .collect();
    indices.sort_unstable();
    indices
}

#[test]
fn torn_tail_is_recovered_on_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();

    let last = {
        let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 1024, 4)).unwrap();
        wal.resume_logging(None).unwrap();
        let mut last = None;
        for i in 0..10 {
            let record = WalRecord::data(format!("payload-{i:02}").into_bytes());
            last = wal.append(&record).unwrap();
        }
        wal.fsync(None).unwrap();
        wal.close().unwrap();
        last.unwrap()
    };

    // a crash mid-drain leaves a partial frame at the tail
    {
        use std::io::Write;
        let path = dir
            .path()
            .join("wal")
            .join("node-1")
            .join(gridwal::segment::segment_file_name(0, 1));
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&[0x02, 0x00, 0x00, 0x00, 0x0A, 0xDE, 0xAD])
            .unwrap();
    }

    let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 1024, 4)).unwrap();
    wal.resume_logging(Some(last)).unwrap();

    // every record whose append returned is intact; the torn frame is not
    // a record
    let records = collect(&wal, None);
    assert_eq!(records.len(), 10);

    // new writes overwrite the torn bytes
    let next = wal.append(&WalRecord::data(&b"after-restart"[..])).unwrap().unwrap();
    assert_eq!(next.file_offset(), last.end_offset());
    let records = collect(&wal, None);
    assert_eq!(records.len(), 11);
    wal.close().unwrap();
}

#[test]
fn multithreaded_appends_preserve_order() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 32768, 4)).unwrap();
    wal.resume_logging(None).unwrap();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let mut appended: Vec<(WalPointer, Vec<u8>)> = Vec::new();
    std::thread::scope(|scope| {
        let mut joins = Vec::new();
        for t in 0..THREADS {
            let wal = &wal;
            joins.push(scope.spawn(move || {
                let mut local = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let mut payload = format!("t{t}-s{i:04}-").into_bytes();
                    payload.extend(std::iter::repeat(b'x').take(i % 40));
                    let pointer = wal
                        .append(&WalRecord::data(payload.clone()))
                        .unwrap()
                        .unwrap();
                    local.push((pointer, payload));
                }
                local
            }));
        }
        for join in joins {
            let local = join.join().unwrap();
            // pointers are handed out in each thread's issuing order
            for pair in local.windows(2) {
                assert!(pair[0].0 < pair[1].0);
            }
            appended.extend(local);
        }
    });

    // sorted by pointer, the appends are exactly what replay yields
    appended.sort_by_key(|(pointer, _)| *pointer);
    let replayed = collect(&wal, None);
    assert_eq!(replayed.len(), THREADS * PER_THREAD);
    for ((pointer, payload), (replayed_ptr, record)) in appended.iter().zip(&replayed) {
        assert_eq!(pointer, replayed_ptr);
        assert_eq!(&record.payload[..], &payload[..]);
    }
    wal.close().unwrap();
}

#[test]
fn pinned_work_slot_blocks_recycling() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(config(dir.path(), WalMode::LogOnly, 128, 2)).unwrap();
    wal.resume_logging(None).unwrap();

    let record = |i: usize| WalRecord::data(format!("record-{i:04}").into_bytes());

    // six 20-byte records per segment; the seventh lands in segment 1
    let mut pointers = Vec::new();
    for i in 0..7 {
        pointers.push(wal.append(&record(i)).unwrap().unwrap());
    }
    assert_eq!(wal.current_segment_index(), 1);
    wal.fsync(None).unwrap();

    // a replay positioned on segment 1 pins its work slot
    let mut replay = wal.replay(Some(pointers[6])).unwrap();
    let (first_ptr, _) = replay.next().unwrap().unwrap();
    assert_eq!(first_ptr, pointers[6]);

    // the writer can fill segment 2, but recycling slot 1 for segment 3 must
    // wait for the replay
    let progress = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        let appender = {
            let wal = &wal;
            let progress = &progress;
            scope.spawn(move || {
                for i in 7..21 {
                    wal.append(&record(i)).unwrap().unwrap();
                    progress.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(wal.current_segment_index(), 2);
        assert!(
            progress.load(Ordering::SeqCst) < 14,
            "appender should be blocked behind the pinned slot"
        );

        // releasing the pin lets the archiver recycle the slot
        drop(replay);
        appender.join().unwrap();
    });
    assert_eq!(progress.load(Ordering::SeqCst), 14);

    wait_until("all filled segments to be archived", || {
        wal.last_archived_index() == Some(2)
    });
    let records = collect(&wal, None);
    assert_eq!(records.len(), 21);
    wal.close().unwrap();
}
