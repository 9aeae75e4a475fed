//! Pool metadata (PMD) engine.
//!
//! An embeddable object-metadata store: a small set of append-only logs (MDCs) hold the
//! authoritative state for every mblock/mlog object in a pool, with MDC0 as the root catalog
//! that bootstraps the rest. See [`pool::Pmd`] for the entry point.
//!
//! This crate owns the in-memory model, the record format, and the allocation/compaction/
//! activation logic. Physical device space accounting, extent I/O, and superblock persistence
//! are collaborator seams defined in [`external`]; a real deployment supplies its own
//! implementations, and this crate ships in-memory reference ones for its own tests.

pub mod activation;
pub mod append;
pub mod compaction;
pub mod config;
pub mod error;
pub mod external;
pub mod ids;
pub mod layout;
pub mod lifecycle;
pub mod mda;
pub mod mdc_alloc;
pub mod mdc_info;
pub mod pool;
pub mod precompactor;
pub mod record;
pub mod selector;
pub mod write_log;
pub mod writeback;

pub use error::{PmdError, PmdErrorKind, Result};
pub use pool::{OpenSlot, Pmd, PmdConfig};
