//! Record storage on top of the [`RepositoryApi`].
//!
//! Every record read returns its current [`RevisionTag`], and every update
//! must present the tag observed on read. Tags are never cached between
//! operations, so a concurrent modification is always reported as a
//! [`StoreError::Conflict`] instead of being overwritten.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use derive_more::{Display, Error, From};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::{debug, info};

use crate::github::{ApiError, EntryKind, RepositoryApi, TreeEntry};

pub use crate::github::DirectoryEntry;

/// Record store errors.
#[derive(Debug, Display, From, Error)]
pub enum StoreError {
    /// Repository API error.
    Api(ApiError),

    /// Unable to (de)serialize a JSON record.
    Json(serde_json::Error),

    /// IO-related error.
    Io(io::Error),

    /// Record was modified since it was last read.
    #[from(ignore)]
    #[display(fmt = "{} was modified concurrently, re-run the command", path)]
    Conflict { path: String },

    /// Required record does not exist.
    #[from(ignore)]
    #[display(fmt = "{} does not exist", path)]
    NotFound { path: String },
}

/// Convert conflicts reported by the API into [`StoreError::Conflict`].
fn surface_conflict(error: ApiError) -> StoreError {
    match error {
        ApiError::Conflict { path } => StoreError::Conflict { path },
        error => StoreError::Api(error),
    }
}

/// Opaque revision tag (blob sha) of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RevisionTag(String);

impl RevisionTag {
    /// Get the raw tag value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw record content with its current revision tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Record content.
    pub content: Vec<u8>,

    /// Revision tag observed on read.
    pub revision: RevisionTag,
}

/// Single file of a multi-file commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleFile {
    /// Path relative to the repository root.
    pub path: String,

    /// File content.
    pub content: Vec<u8>,
}

/// Repository-backed record store.
pub struct RecordStore {
    /// Underlying repository API.
    api: Box<dyn RepositoryApi>,
}

impl RecordStore {
    /// Create new record store on top of the provided API.
    pub fn new(api: Box<dyn RepositoryApi>) -> Self {
        Self { api }
    }

    /// Read a record, returning [`None`] if it does not exist.
    pub fn read_record(&self, path: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.api.get_file(path)?.map(|file| Record {
            content: file.content,
            revision: RevisionTag(file.sha),
        }))
    }

    /// Read a record that is required to exist.
    pub fn require_record(&self, path: &str) -> Result<Record, StoreError> {
        self.read_record(path)?.ok_or_else(|| StoreError::NotFound {
            path: path.to_owned(),
        })
    }

    /// Write a record.
    ///
    /// Without a `revision` the record is created, and the write fails with
    /// [`StoreError::Conflict`] if it already exists. With a `revision` the
    /// record is updated only if the tag still matches.
    pub fn write_record(
        &self,
        path: &str,
        content: &[u8],
        revision: Option<&RevisionTag>,
        message: &str,
    ) -> Result<(), StoreError> {
        debug!(path, update = revision.is_some(), "writing record");

        self.api
            .put_file(path, content, revision.map(RevisionTag::as_str), message)
            .map_err(surface_conflict)
    }

    /// Read and deserialize a JSON record.
    pub fn read_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<(T, RevisionTag)>, StoreError> {
        match self.read_record(path)? {
            Some(record) => Ok(Some((
                serde_json::from_slice(&record.content)?,
                record.revision,
            ))),
            None => Ok(None),
        }
    }

    /// Serialize and write a JSON record.
    ///
    /// Records are stored tab-indented, to keep them readable in the repository.
    pub fn write_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        revision: Option<&RevisionTag>,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut content = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut content, PrettyFormatter::with_indent(b"\t"));
        value.serialize(&mut serializer)?;

        self.write_record(path, &content, revision, message)
    }

    /// List a directory, returning [`None`] if it does not exist.
    pub fn list_directory(&self, path: &str) -> Result<Option<Vec<DirectoryEntry>>, StoreError> {
        Ok(self.api.list_directory(path)?)
    }

    /// Check if anything exists at `path`, either a file or a directory.
    pub fn exists(&self, path: &str) -> Result<bool, StoreError> {
        match self.api.list_directory(path) {
            Ok(listing) => Ok(listing.is_some()),
            // Listing a file path returns the file itself.
            Err(ApiError::UnexpectedContent { .. }) => Ok(true),
            Err(error) => Err(error.into()),
        }
    }

    /// Download every file of a remote directory into `destination`.
    ///
    /// Nested directories are not descended into. Returns the written paths.
    pub fn download_directory(
        &self,
        path: &str,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let entries = self
            .list_directory(path)?
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_owned(),
            })?;

        fs::create_dir_all(destination)?;

        let mut written = Vec::new();

        for entry in entries.iter().filter(|entry| entry.kind == EntryKind::File) {
            let record = self.require_record(&entry.path)?;
            let target = destination.join(&entry.name);

            fs::write(&target, &record.content)?;
            written.push(target);
        }

        Ok(written)
    }

    /// Atomically commit multiple files.
    ///
    /// The branch tip is read once, a blob is created per file, the blobs are
    /// linked into a tree based on the tip's tree, and a single commit parented
    /// on the tip is created. Finally the branch is fast-forwarded.
    ///
    /// If the branch moved in the meantime, the reference update is rejected and
    /// [`StoreError::Conflict`] is returned; the branch stays untouched, and
    /// the created objects are unreachable. Callers must retry from scratch.
    pub fn create_commit(&self, files: &[BundleFile], message: &str) -> Result<String, StoreError> {
        let tip = self.api.branch_tip()?;

        debug!(tip = %tip.commit, files = files.len(), "creating commit");

        let entries = files
            .iter()
            .map(|file| {
                Ok(TreeEntry {
                    path: file.path.clone(),
                    sha: self.api.create_blob(&file.content)?,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        let tree = self.api.create_tree(&tip.tree, &entries)?;
        let commit = self.api.create_commit(message, &tree, &[&tip.commit])?;

        self.api.update_branch(&commit).map_err(surface_conflict)?;

        info!(%commit, files = files.len(), "commit published");

        Ok(commit)
    }
}
