//! # AcornDB Core
//!
//! An embedded, single-process, persistent key-value store with typed
//! data structures (plain KV, sets, sorted sets, lists) over an
//! append-only segmented log.
//!
//! This crate provides:
//! - Segmented append-only data files with size-based rollover
//! - A per-bucket in-memory B+Tree index mapping keys to log locations
//! - Closure-scoped `view` / `update` transactions with a single writer
//!   and parallel readers
//! - Log replay on open, honoring delete markers and lazy expiry
//! - An exclusive directory lock for single-instance access
//!
//! ## Example
//!
//! ```no_run
//! use acorndb_core::{Config, CoreResult, Database, PERSISTENT};
//!
//! fn main() -> CoreResult<()> {
//!     let db = Database::open("my_store", Config::default())?;
//!     db.update(|tx| tx.put("bucket", b"hello", b"world", PERSISTENT))?;
//!     db.view(|tx| {
//!         assert_eq!(tx.get("bucket", b"hello")?, b"world");
//!         Ok(())
//!     })?;
//!     db.close()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod dir;
mod error;
mod index;
mod recovery;
mod segment;
mod structures;
mod tx;
mod types;

pub use config::{Config, ErrorHandler, IndexMode};
pub use db::Database;
pub use error::{CoreError, CoreResult};
pub use index::RecordPtr;
pub use tx::{BucketIter, Tx};
pub use types::{FileId, TxId};

pub use acorndb_codec::{Kind, PERSISTENT};
