#![forbid(unsafe_code)]
//! The snapshot translation engine.
//!
//! A dm-user target forwards every read and write of a dm-snapshot device to
//! this daemon over a control device. The daemon answers them by
//! synthesising the legacy kernel copy-on-write layout on the fly from the
//! internal COW log:
//!
//! - [`metadata`] assigns kernel chunk IDs to the log's operations once at
//!   startup and builds the cached disk-exception areas.
//! - [`worker`] services the request loop: metadata and data reads, the
//!   sector-0 legacy header, and the merge write-backs through which the
//!   kernel reports progress, which are diffed, folded into the forward
//!   operation cursor and durably committed to the log.
//! - [`bufsink`] is the staging buffer shared with the control device.
//!
//! Everything is single-threaded: the kernel issues one request per device
//! at a time and waits for the response.

pub mod bufsink;
pub mod metadata;
pub mod worker;

pub use bufsink::PayloadBuffer;
pub use metadata::{build_metadata, ExceptionArea, SnapshotMetadata};
pub use worker::{ControlChannel, SnapshotWorker};
