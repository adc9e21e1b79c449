//! # kiln-queue
//!
//! Persistent dependency-aware job queue backing the kiln image-build
//! service.
//!
//! The queue mediates between producers, which submit jobs with declared
//! prerequisites, and workers, which consume jobs of selected types and
//! report results. Every job record is persisted to a storage directory so
//! the queue survives process restarts; the dispatch state derived from
//! those records (per-type pending channels and the dependant index) is
//! kept in memory and rebuilt on startup.
//!
//! ## Features
//!
//! - **Durability**: one JSON document per job, replaced atomically, so a
//!   crash at any point leaves every record either old-complete or
//!   new-complete
//! - **Dependencies**: a job becomes dispatchable only once all of its
//!   dependencies have finished
//! - **FIFO per type**: jobs of one type are dispatched in the order they
//!   became ready; no ordering is promised across types
//! - **Concurrent workers**: any number of tasks may wait in
//!   [`JobQueue::dequeue`] at once, each filtered to the job types it
//!   accepts, with cancellation via a [`CancellationToken`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use kiln_queue::JobQueue;
//! use serde_json::{json, Value};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), kiln_queue::QueueError> {
//! let queue = JobQueue::open("/var/lib/kiln/jobs")?;
//!
//! let build = queue
//!     .enqueue("osbuild", &json!({ "distro": "fedora-38" }), &[])
//!     .await?;
//! let upload = queue
//!     .enqueue("upload", &json!({ "target": "s3" }), &[build])
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! let (id, args): (_, Value) = queue.dequeue(&cancel, &["osbuild"]).await?;
//! // ... run the build ...
//! queue.finish(id, &json!({ "status": "success" })).await?;
//! # let _ = upload;
//! # Ok(())
//! # }
//! ```
//!
//! A storage directory must be governed by at most one [`JobQueue`]
//! instance at a time; there is no cross-process locking. A single
//! instance is safe to share across concurrent tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod queue;
mod record;
pub mod store;

pub use error::QueueError;
pub use queue::{JobQueue, JobStatus, PENDING_CHANNEL_CAPACITY};

// The cancel token accepted by `JobQueue::dequeue`, re-exported so callers
// do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
