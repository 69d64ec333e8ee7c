//! # AcornDB Codec
//!
//! Record wire codec for AcornDB log segments.
//!
//! Every mutation the store performs is persisted as one log record:
//!
//! ```text
//! ┌─────┬───────────┬───────┬──────────┬────────────┬──────┬──────┬─────────────┬─────┐
//! │ crc │ timestamp │ tx_id │ key_size │ value_size │ flag │ kind │ bucket_size │ ttl │
//! ├─────┴───────────┴───────┴──────────┴────────────┴──────┴──────┴─────────────┴─────┤
//! │ bucket bytes │ key bytes │ value bytes                                            │
//! └────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The CRC32 covers everything after the
//! crc field itself. The high bit of the flag field marks the final
//! record of a transaction.
//!
//! ## Usage
//!
//! ```
//! use acorndb_codec::{decode_entry, Entry, Flag, Kind, Meta, PERSISTENT};
//!
//! let entry = Entry::new(
//!     b"bucket".to_vec(),
//!     b"key".to_vec(),
//!     b"value".to_vec(),
//!     Meta::new(Flag::Put, Kind::Kv, PERSISTENT),
//! );
//! let bytes = entry.encode().unwrap();
//! let decoded = decode_entry(&bytes).unwrap();
//! assert_eq!(decoded.entry, entry);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod entry;
mod error;

pub use decoder::{decode_entry, Decoded, RecordHeader};
pub use entry::{crc32, Entry, Flag, Kind, Meta, HEADER_SIZE, PERSISTENT, TX_FINAL_BIT};
pub use error::{CodecError, CodecResult};
