//! Repository-backed record storage.
//!
//! A remote git repository is used as a small database: every record is
//! a file at a deterministic path, and every write is a commit. Writes
//! carry the revision tag (blob sha) observed on read, so concurrent
//! modifications are rejected by the repository itself instead of
//! being silently overwritten.

pub mod access;
pub mod credentials;
pub mod github;
pub mod records;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
