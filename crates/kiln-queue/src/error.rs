//! Queue error types.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors returned by [`JobQueue`](crate::JobQueue) operations.
///
/// Every kind is distinguishable by callers. The queue performs no retries
/// and surfaces errors unchanged; when a mutating operation fails, the
/// in-memory indices are left untouched because they are only updated after
/// a successful write.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// No persisted record exists for the given job id.
    #[error("unknown job: {id}")]
    UnknownJob {
        /// The id with no persisted record.
        id: Uuid,
    },

    /// An enqueue referenced a dependency id with no persisted record.
    #[error("unknown dependency: {id}")]
    UnknownDependency {
        /// The missing dependency id.
        id: Uuid,
    },

    /// A finish was invoked on a job that is not in the Running state,
    /// i.e. one that was never dequeued or that has already finished.
    #[error("job is not running: {id}")]
    NotRunning {
        /// The job id.
        id: Uuid,
    },

    /// A dequeue was aborted via its cancel token before a job arrived.
    #[error("dequeue was cancelled")]
    Cancelled,

    /// A pending channel closed while a dequeue was waiting on it. The
    /// queue holds both ends of every pending channel for its whole
    /// lifetime, so this indicates an internal invariant violation.
    #[error("pending channel closed unexpectedly")]
    ChannelClosed,

    /// Caller-supplied job arguments could not be serialized.
    #[error("cannot serialize job arguments: {0}")]
    BadArguments(#[source] serde_json::Error),

    /// A caller-supplied job result could not be serialized.
    #[error("cannot serialize job result: {0}")]
    BadResult(#[source] serde_json::Error),

    /// A stored payload could not be deserialized into the caller's type.
    #[error("corrupt payload for job {id}: {source}")]
    Corrupt {
        /// The job whose payload failed to deserialize.
        id: Uuid,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A persisted job record could not be parsed. Raised during recovery
    /// when a record in the storage directory is unreadable, and by any
    /// operation that encounters a record damaged after it was written.
    #[error("corrupt job record '{key}': {detail}")]
    CorruptStore {
        /// Storage key of the unparseable record.
        key: String,
        /// Description of the parse failure.
        detail: String,
    },

    /// An underlying filesystem operation failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}
