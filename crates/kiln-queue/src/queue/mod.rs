//! The queue protocol: enqueue, dequeue, finish, status, and recovery.
//!
//! Jobs are persisted through [`JsonStore`], one record per job, but the
//! store is not used as a database: the state needed for dispatch decisions
//! (per-type pending channels and the dependant index) is derived from the
//! records, kept in memory, and rebuilt from disk on construction. Access
//! to a storage directory must therefore be exclusive to one [`JobQueue`]
//! at a time. A single instance is safe to share across concurrent tasks.
//!
//! # Locking
//!
//! One queue-wide mutex guards the in-memory indices and makes every
//! record read-modify-write atomic. All operations except
//! [`JobQueue::status`] hold it for their critical section. Dequeue is the
//! exception to the exception: it releases the lock while waiting on
//! pending channels, so that enqueues and finishes can make progress while
//! workers wait, and re-acquires it to finalize.
//!
//! # Durability
//!
//! Every observable state transition is preceded by a successful write of
//! the updated record. The in-memory indices are only touched after the
//! write succeeds, so a storage failure can never leave them ahead of the
//! disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::future::select_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::record::{unique_sorted, JobRecord};
use crate::store::{JsonStore, StoreError};

#[cfg(test)]
mod tests;

/// Backpressure bound on each per-type pending channel: the number of
/// ready ids a type can accumulate before further enqueues of that type
/// block until a worker drains one. A tunable sanity limit, not a
/// contract.
pub const PENDING_CHANNEL_CAPACITY: usize = 100;

/// Both ends of a per-type pending channel. The pair lives for the
/// queue's whole lifetime: the sender publishes ready ids under the lock,
/// and receivers are cloned out to waiting dequeues.
#[derive(Debug)]
struct PendingChannel {
    tx: Sender<Uuid>,
    rx: Receiver<Uuid>,
}

impl PendingChannel {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }
}

/// In-memory dispatch state, guarded by the queue-wide lock.
#[derive(Debug)]
struct Indices {
    /// Ready ids per job type. Channels are created on first reference to
    /// a type, by enqueue and dequeue alike.
    pending: HashMap<String, PendingChannel>,

    /// For each unfinished job id, the ids of jobs awaiting it. Entries
    /// are added by enqueue and purged by finish once the dependants have
    /// been re-evaluated.
    dependants: HashMap<Uuid, Vec<Uuid>>,
}

impl Indices {
    /// The pending channel for `job_type`, created empty if this is the
    /// first reference to the type.
    fn pending_channel(&mut self, job_type: &str) -> &PendingChannel {
        if !self.pending.contains_key(job_type) {
            self.pending.insert(
                job_type.to_owned(),
                PendingChannel::bounded(PENDING_CHANNEL_CAPACITY),
            );
        }
        &self.pending[job_type]
    }
}

/// The lifecycle view of a single job, as reported by
/// [`JobQueue::status`].
///
/// `queued_at` is always set; `started_at` and `finished_at` are set once
/// the job has been dequeued and finished respectively. `result` is
/// filled only for finished jobs.
#[derive(Debug)]
pub struct JobStatus<R> {
    /// When the job was enqueued.
    pub queued_at: DateTime<Utc>,
    /// When the job was dequeued by a worker, if it has been.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job's result was recorded, if it has been.
    pub finished_at: Option<DateTime<Utc>>,
    /// The worker-supplied result, for finished jobs.
    pub result: Option<R>,
}

/// A persistent, dependency-aware job queue over a storage directory.
///
/// See the [crate docs](crate) for an overview and example.
#[derive(Debug)]
pub struct JobQueue {
    store: JsonStore,
    indices: Mutex<Indices>,

    /// Rotates the polling order across a dequeue's accepted types, so a
    /// steadily-full channel cannot starve the others.
    poll_offset: AtomicUsize,
}

impl JobQueue {
    /// Opens a queue over `dir`, creating the directory if needed and
    /// rebuilding the dispatch state from any records persisted by
    /// previous runs.
    ///
    /// Jobs that were already dequeued before the restart (`started_at`
    /// set, `finished_at` unset) are left untouched and are not
    /// re-dispatched; see `DESIGN.md` for the rationale.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::CorruptStore`] if any persisted record cannot
    /// be parsed, or [`QueueError::Storage`] on filesystem failure.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let store = JsonStore::open(dir)?;

        let mut indices = Indices {
            pending: HashMap::new(),
            dependants: HashMap::new(),
        };

        // Scan every persisted record, partitioning never-dispatched jobs
        // into ready (all dependencies finished) and waiting.
        let mut ready: HashMap<String, Vec<Uuid>> = HashMap::new();
        let mut waiting = 0usize;
        let mut skipped = 0usize;

        for key in store.list()? {
            let Ok(id) = Uuid::parse_str(&key) else {
                return Err(QueueError::CorruptStore {
                    key,
                    detail: "file name is not a job id".to_owned(),
                });
            };
            let record = read_record(&store, id)?;

            if record.started_at.is_some() {
                // Already picked up before the restart; owned by whoever
                // dequeued it. Never dispatch a job a second time.
                skipped += 1;
                continue;
            }

            let unfinished = unfinished_dependencies(&store, &record.dependencies)?;
            if unfinished.is_empty() {
                ready.entry(record.job_type).or_default().push(id);
            } else {
                waiting += 1;
                for dep in unfinished {
                    indices.dependants.entry(dep).or_default().push(id);
                }
            }
        }

        let mut published = 0usize;
        for (job_type, ids) in ready {
            // No consumer exists during construction, so the channel must
            // have room for every recovered id up front.
            let channel = PendingChannel::bounded(ids.len().max(PENDING_CHANNEL_CAPACITY));
            for id in ids {
                channel
                    .tx
                    .try_send(id)
                    .map_err(|_| QueueError::ChannelClosed)?;
                published += 1;
            }
            indices.pending.insert(job_type, channel);
        }

        debug!(published, waiting, skipped, "rebuilt queue state");

        Ok(Self {
            store,
            indices: Mutex::new(indices),
            poll_offset: AtomicUsize::new(0),
        })
    }

    /// Persists a new job and returns its id.
    ///
    /// `dependencies` are deduplicated and must all name existing jobs.
    /// If every dependency has already finished (or there are none), the
    /// job is published to its type's pending channel immediately;
    /// otherwise it stays waiting until the last dependency finishes.
    ///
    /// Blocks when the type's pending channel is full; that backpressure
    /// is intentional.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::BadArguments`] if `args` cannot be
    /// serialized, [`QueueError::UnknownDependency`] if a dependency does
    /// not exist, or [`QueueError::Storage`] if the record cannot be
    /// written. On error, nothing is persisted and the indices are
    /// unchanged.
    pub async fn enqueue<A: Serialize>(
        &self,
        job_type: &str,
        args: &A,
        dependencies: &[Uuid],
    ) -> Result<Uuid, QueueError> {
        let args = to_raw_value(args).map_err(QueueError::BadArguments)?;

        let mut indices = self.indices.lock().await;

        let record = JobRecord {
            id: Uuid::new_v4(),
            job_type: job_type.to_owned(),
            args: Some(args),
            dependencies: unique_sorted(dependencies),
            result: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        // Verify every dependency exists before persisting anything.
        let unfinished =
            unfinished_dependencies(&self.store, &record.dependencies).map_err(|e| match e {
                QueueError::UnknownJob { id } => QueueError::UnknownDependency { id },
                other => other,
            })?;

        // Write before touching the indices, so a failed write cannot
        // leave them out of sync with the store.
        self.store.write(&record.id.to_string(), &record)?;

        if unfinished.is_empty() {
            // May block when the channel is at capacity. A waiting dequeue
            // drains ids without taking the lock, so holding it here
            // cannot deadlock.
            let tx = indices.pending_channel(job_type).tx.clone();
            tx.send(record.id)
                .await
                .map_err(|_| QueueError::ChannelClosed)?;
        } else {
            for dep in unfinished {
                indices.dependants.entry(dep).or_default().push(record.id);
            }
        }

        debug!(id = %record.id, job_type, "job enqueued");
        Ok(record.id)
    }

    /// Waits for a pending job of one of the accepted `job_types`, stamps
    /// it as started, and returns its id together with its deserialized
    /// arguments.
    ///
    /// Within one type, ids are returned in the order they became
    /// pending. Across types the pick is non-starving but otherwise
    /// unspecified. Any number of dequeues may wait concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Cancelled`] if `cancel` fires before a job
    /// arrives (including when it was already triggered on entry, with no
    /// side effects in either case), [`QueueError::Corrupt`] if the
    /// stored arguments cannot be deserialized into `A`, or
    /// [`QueueError::Storage`] if the started stamp cannot be written.
    pub async fn dequeue<A: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        job_types: &[&str],
    ) -> Result<(Uuid, A), QueueError> {
        let receivers: Vec<Receiver<Uuid>> = {
            let mut indices = self.indices.lock().await;

            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            // Resolve (and create, so future enqueues can publish) the
            // channel of every accepted type.
            job_types
                .iter()
                .map(|t| indices.pending_channel(t).rx.clone())
                .collect()
            // Lock released here, while we wait.
        };

        let id = self.next_ready(cancel, receivers).await?;

        let guard = self.indices.lock().await;
        let mut record = read_record(&self.store, id)?;
        let args = decode_payload(record.args.as_deref(), id)?;

        record.started_at = Some(Utc::now());
        self.store.write(&id.to_string(), &record)?;
        drop(guard);

        debug!(%id, job_type = %record.job_type, "job dequeued");
        Ok((id, args))
    }

    /// Waits until one of `receivers` yields an id or `cancel` fires.
    async fn next_ready(
        &self,
        cancel: &CancellationToken,
        mut receivers: Vec<Receiver<Uuid>>,
    ) -> Result<Uuid, QueueError> {
        if receivers.is_empty() {
            // No accepted types: nothing can ever arrive, so the only
            // possible outcome is cancellation.
            cancel.cancelled().await;
            return Err(QueueError::Cancelled);
        }

        // Rotate the polling order between calls; select_all favors
        // earlier futures when several are ready.
        let offset = self.poll_offset.fetch_add(1, Ordering::Relaxed) % receivers.len();
        receivers.rotate_left(offset);

        let recvs: Vec<_> = receivers.iter().map(|rx| Box::pin(rx.recv())).collect();
        tokio::select! {
            () = cancel.cancelled() => Err(QueueError::Cancelled),
            (received, _, _) = select_all(recvs) => {
                received.map_err(|_| QueueError::ChannelClosed)
            }
        }
    }

    /// Records a job's result, marks it finished, and publishes any
    /// dependants whose last unfinished dependency was this job.
    ///
    /// Dependants are re-evaluated in the order they were recorded. If a
    /// re-evaluation fails partway, the error is surfaced and dependants
    /// already published stay published; a later retry of the failed
    /// finish cannot double-publish, because each finished id's dependant
    /// entry is processed at most once.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownJob`] if no such job exists,
    /// [`QueueError::NotRunning`] unless the job has been dequeued and
    /// not yet finished, [`QueueError::BadResult`] if `result` cannot be
    /// serialized, or [`QueueError::Storage`] on write failure.
    pub async fn finish<R: Serialize>(&self, id: Uuid, result: &R) -> Result<(), QueueError> {
        let result = to_raw_value(result).map_err(QueueError::BadResult)?;

        let mut indices = self.indices.lock().await;

        let mut record = read_record(&self.store, id)?;
        if record.started_at.is_none() || record.finished_at.is_some() {
            return Err(QueueError::NotRunning { id });
        }

        record.finished_at = Some(Utc::now());
        record.result = Some(result);

        // Write before re-evaluating dependants: each evaluation reads
        // this record back and must observe it finished.
        self.store.write(&id.to_string(), &record)?;

        if let Some(waiting) = indices.dependants.get(&id).cloned() {
            for dependant in waiting {
                let dep_record = read_record(&self.store, dependant)?;
                let unfinished = unfinished_dependencies(&self.store, &dep_record.dependencies)?;
                if unfinished.is_empty() {
                    let tx = indices.pending_channel(&dep_record.job_type).tx.clone();
                    tx.send(dependant)
                        .await
                        .map_err(|_| QueueError::ChannelClosed)?;
                    debug!(id = %dependant, "dependant released");
                }
            }
        }
        indices.dependants.remove(&id);

        debug!(%id, "job finished");
        Ok(())
    }

    /// Reports a job's three lifecycle timestamps, plus its deserialized
    /// result once it has finished.
    ///
    /// Reads the persisted record directly and takes no lock, so it never
    /// contends with workers.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownJob`] if no such job exists, or
    /// [`QueueError::Corrupt`] if the stored result cannot be
    /// deserialized into `R`.
    pub fn status<R: DeserializeOwned>(&self, id: Uuid) -> Result<JobStatus<R>, QueueError> {
        let record = read_record(&self.store, id)?;

        let result = if record.is_finished() {
            Some(decode_payload(record.result.as_deref(), id)?)
        } else {
            None
        };

        Ok(JobStatus {
            queued_at: record.queued_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            result,
        })
    }
}

/// Reads the record for `id`, mapping absence to `UnknownJob` and parse
/// failures to `CorruptStore`.
fn read_record(store: &JsonStore, id: Uuid) -> Result<JobRecord, QueueError> {
    match store.read(&id.to_string()) {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(QueueError::UnknownJob { id }),
        Err(StoreError::Deserialize { key, source }) => Err(QueueError::CorruptStore {
            key,
            detail: source.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Reads every dependency record and returns the ids that have not yet
/// finished, preserving the input order.
fn unfinished_dependencies(store: &JsonStore, deps: &[Uuid]) -> Result<Vec<Uuid>, QueueError> {
    let mut unfinished = Vec::new();
    for dep in deps {
        if !read_record(store, *dep)?.is_finished() {
            unfinished.push(*dep);
        }
    }
    Ok(unfinished)
}

/// Deserializes a stored payload into the caller's type. An absent
/// payload reads as JSON `null`, mirroring how it was written.
fn decode_payload<T: DeserializeOwned>(raw: Option<&RawValue>, id: Uuid) -> Result<T, QueueError> {
    let json = raw.map_or("null", RawValue::get);
    serde_json::from_str(json).map_err(|source| QueueError::Corrupt { id, source })
}
