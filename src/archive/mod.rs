//! # Audio Archival
//!
//! Best-effort persistence of the raw audio stream, independent of the
//! transcription path.
//!
//! ## Key Components:
//! - **Object Store Client**: the blob-store seam (memory / filesystem)
//! - **Archiver**: per-session sliding window with rolling uploads
//!
//! Archive failures are counted and logged, never surfaced to the client;
//! the next ticker firing simply tries again with a broader window.

pub mod archiver;      // sliding-window accumulator and upload task
pub mod store;         // object store trait and implementations

pub use archiver::{spawn_archiver, ArchiverConfig, ArchiverHandle};
pub use store::{FsObjectStore, MemoryObjectStore, ObjectStore};
