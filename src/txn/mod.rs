//! # Transactions
//!
//! Read transactions ([`PageReadTrx`]) are immutable snapshots of one
//! committed revision; any number run concurrently. Write transactions
//! ([`PageWriteTrx`]) stage copy-on-write state in a durable intent log
//! ([`TrxLog`]) and publish it atomically by appending pages and flipping
//! the uber beacon; at most one is active per resource.

mod log;
mod read;
mod write;

pub use log::TrxLog;
pub use read::PageReadTrx;
pub use write::PageWriteTrx;
