//! Persistent record store: a small key-to-document map on the filesystem.
//!
//! One regular file per key, holding the JSON document for that key. Writes
//! follow the atomic replacement protocol: serialize in memory, write to a
//! temp file in the same directory, fsync the data, rename over the final
//! path, then fsync the containing directory. A crash at any point leaves
//! either the old complete document or the new complete document, never a
//! partial one, and a failed write leaves the previous value intact.
//!
//! Files are created with owner-only permissions (0600; the storage
//! directory itself is 0700). The store performs no locking; the queue
//! above it serializes access.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Upper bound on the size of a single stored document.
///
/// Job records are a few kilobytes; anything approaching this limit is
/// damaged, and refusing it keeps a corrupt store from exhausting memory
/// during recovery.
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A document could not be serialized to JSON.
    #[error("cannot serialize document '{key}': {source}")]
    Serialize {
        /// Key of the document that failed to serialize.
        key: String,
        /// The underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored document could not be parsed.
    #[error("cannot parse document '{key}': {source}")]
    Deserialize {
        /// Key of the unparseable document.
        key: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored document exceeds [`MAX_DOCUMENT_SIZE`].
    #[error("document '{key}' is {size} bytes, over the {max} byte limit")]
    TooLarge {
        /// Key of the oversized document.
        key: String,
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// An underlying I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// A key-to-document store backed by one JSON file per key.
#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Opens the store over `dir`, creating the directory (mode 0700 on
    /// Unix) if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();

        if !dir.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&dir)
                    .map_err(|e| StoreError::io("create storage directory", e))?;
            }

            #[cfg(not(unix))]
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io("create storage directory", e))?;
        }

        Ok(Self { dir })
    }

    /// Serializes `document` and atomically replaces the file for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] if the document cannot be encoded,
    /// or [`StoreError::Io`] if any step of the write protocol fails. On
    /// failure the previous value for `key`, if any, is left intact.
    pub fn write<T: Serialize>(&self, key: &str, document: &T) -> Result<(), StoreError> {
        // Serialize before any file I/O, so an encoding failure cannot
        // leave a partial file behind.
        let json = serde_json::to_vec(document).map_err(|source| StoreError::Serialize {
            key: key.to_owned(),
            source,
        })?;

        // Temp file in the same directory: same filesystem, so the rename
        // below is atomic. NamedTempFile creates it with mode 0600.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| StoreError::io("create temp file", e))?;

        tmp.write_all(&json)
            .map_err(|e| StoreError::io("write temp file", e))?;
        tmp.flush()
            .map_err(|e| StoreError::io("flush temp file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io("fsync temp file", e))?;

        tmp.persist(self.dir.join(key))
            .map_err(|e| StoreError::io("rename temp file into place", e.error))?;

        // fsync the directory so the rename itself is durable.
        let dir = File::open(&self.dir)
            .map_err(|e| StoreError::io("open storage directory for fsync", e))?;
        dir.sync_all()
            .map_err(|e| StoreError::io("fsync storage directory", e))?;

        Ok(())
    }

    /// Reads and deserializes the document for `key`, or `None` if no such
    /// key exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TooLarge`] if the file exceeds
    /// [`MAX_DOCUMENT_SIZE`], [`StoreError::Deserialize`] if it cannot be
    /// parsed, or [`StoreError::Io`] on any other filesystem failure.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(key);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("open document", e)),
        };

        let size = file
            .metadata()
            .map_err(|e| StoreError::io("stat document", e))?
            .len();
        if size > MAX_DOCUMENT_SIZE {
            return Err(StoreError::TooLarge {
                key: key.to_owned(),
                size,
                max: MAX_DOCUMENT_SIZE,
            });
        }

        // Size checked against the limit above, which is well below
        // usize::MAX on all supported targets.
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = Vec::with_capacity(size as usize);
        file.take(MAX_DOCUMENT_SIZE)
            .read_to_end(&mut buf)
            .map_err(|e| StoreError::io("read document", e))?;

        serde_json::from_slice(&buf)
            .map(Some)
            .map_err(|source| StoreError::Deserialize {
                key: key.to_owned(),
                source,
            })
    }

    /// Returns whether a document exists for `key`.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.dir.join(key).is_file()
    }

    /// Returns the set of keys currently present, in no particular order.
    ///
    /// Dot-prefixed entries are skipped: an interrupted atomic write can
    /// leave a `.tmp*` file behind, and such residue must never be taken
    /// for a document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StoreError::io("list storage directory", e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list storage directory", e))?;
            let Ok(name) = entry.file_name().into_string() else {
                // The store only ever writes UTF-8 names.
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .map_err(|e| StoreError::io("stat directory entry", e))?;
            if file_type.is_file() {
                keys.push(name);
            }
        }

        Ok(keys)
    }
}
