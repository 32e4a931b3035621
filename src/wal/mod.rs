//! WAL stream parsing and the block delta-map it feeds.

pub mod delta_map;
pub mod parser;
pub mod rmgr;
pub mod tail;

pub use delta_map::{DeltaMap, DeltaMapEntry};
pub use parser::{BlockRef, WalRecord, WalStreamParser};
