//! frozenDB: an append-only, single-file embedded key-value store for JSON
//! values keyed by time-ordered UUIDv7 identifiers.
//!
//! Components are organized leaves-first, mirroring their dependency order:
//! `codec` → `file_manager` → `row_emitter` → `finder` → `transaction` → `db`.

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod file_manager;
pub mod finder;
pub mod fuzzy_search;
pub mod header;
pub mod key;
pub mod recovery;
pub mod row_emitter;
pub mod transaction;
pub mod watcher;

pub use db::{Db, FinderStrategy, Mode};
pub use error::{Error, ErrorKind, Result};
pub use transaction::Transaction;
