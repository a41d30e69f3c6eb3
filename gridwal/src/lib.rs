//! # gridwal
//!
//! Embedded segmented write-ahead log, extracted from an in-memory data
//! grid with durable persistence.
//!
//! This crate provides a durable, append-only log with:
//! - Fixed-size segments in a recycled work ring, retired to an archive
//!   directory by a background worker
//! - Lock-free offset reservation for concurrent producers, with batched
//!   drains and one serialized write path
//! - Configurable durability modes, from write-disabled to fsync-on-sync
//!   with pre-allocated segments
//! - Replay from any pointer across archive and work segments, tolerant of
//!   torn tails after a crash
//! - Reservations and work-slot pins so live readers block deletion and
//!   slot recycling
//!
//! ```no_run
//! use gridwal::{Wal, WalConfig, WalMode, WalRecord};
//!
//! # fn main() -> Result<(), gridwal::WalError> {
//! let config = WalConfig::new("/var/lib/grid/wal", "/var/lib/grid/wal-archive", "node-1")
//!     .with_mode(WalMode::LogOnly);
//! let wal = Wal::open(config)?;
//! wal.resume_logging(None)?;
//!
//! let pointer = wal.append(&WalRecord::data(&b"state delta"[..]))?;
//! wal.fsync(pointer)?;
//!
//! for entry in wal.replay(None)? {
//!     let (pointer, record) = entry?;
//!     println!("{pointer}: {} bytes", record.payload.len());
//! }
//! wal.close()?;
//! # Ok(())
//! # }
//! ```

mod archive;
mod handle;

pub mod error;
pub mod pointer;
pub mod record;
pub mod replay;
pub mod segment;
pub mod wal;

pub use error::WalError;
pub use pointer::WalPointer;
pub use record::{ReadOutcome, RecordCodec, RecordType, WalRecord, SERIALIZER_VERSION};
pub use replay::WalReplay;
pub use wal::{FailureHandler, LogFailureHandler, Wal, WalConfig, WalMode, WalStats};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of work-ring slots.
pub const DEFAULT_WAL_SEGMENTS: u64 = 10;

/// Default drain threshold for the pending record chain (128 KiB).
pub const DEFAULT_BUFFER_BYTES: u32 = 128 * 1024;
