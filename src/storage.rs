//! Storage Resolution Module
//!
//! Maps an authenticated identity to its isolated storage directory and
//! resolves filenames inside it. Layout:
//!
//! ```text
//! <root>/<first char of identity>/<identity>/<filename>
//! ```
//!
//! The single-character shard bounds directory fan-out at the root. Each
//! identity's files live flatly in its own directory; the protocol never
//! creates subdirectories.
//!
//! Every name that ends up in a path - the identity as much as the filename -
//! goes through [`checked_name`] first. Blind concatenation of peer-supplied
//! strings is how path traversal happens, so resolution without the check
//! does not exist in this module's API.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The name would escape, or cannot be confined to, the storage root.
    #[error("name not permitted: {0}")]
    OutOfScope(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Validate a peer-supplied name as a single safe path component.
///
/// Rejected: empty names, names containing a path separator, names
/// containing a `..` sequence, and names starting with a dot.
pub fn checked_name(name: &str) -> Result<&str, StorageError> {
    if name.is_empty() {
        return Err(StorageError::OutOfScope("empty name".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(StorageError::OutOfScope(format!(
            "'{name}' contains a path separator"
        )));
    }
    if name.contains("..") {
        return Err(StorageError::OutOfScope(format!(
            "'{name}' contains a parent-directory sequence"
        )));
    }
    if name.starts_with('.') {
        return Err(StorageError::OutOfScope(format!(
            "'{name}' is a hidden name"
        )));
    }
    Ok(name)
}

/// A validated username, usable as a storage-partition key.
///
/// Construction goes through [`checked_name`], so an `Identity` is always a
/// non-empty single path component. Immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(String);

impl Identity {
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        checked_name(name).map(|n| Self(n.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard key: the identity's first character.
    fn shard(&self) -> String {
        // parse() guarantees at least one character
        self.0.chars().take(1).collect()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves identities and filenames to paths under one storage root.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    root: PathBuf,
}

impl StorageResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The identity's directory, created on first use with owner-only
    /// permissions.
    pub async fn user_dir(&self, identity: &Identity) -> Result<PathBuf, StorageError> {
        let dir = self.root.join(identity.shard()).join(identity.as_str());
        fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(&dir).await?.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(&dir, permissions).await?;
        }

        Ok(dir)
    }

    /// Resolve `filename` inside the identity's directory.
    ///
    /// Fails with `OutOfScope` for any name that is not a plain file name,
    /// before any path is built.
    pub async fn resolve(
        &self,
        identity: &Identity,
        filename: &str,
    ) -> Result<PathBuf, StorageError> {
        let name = checked_name(filename)?;
        let dir = self.user_dir(identity).await?;
        Ok(dir.join(name))
    }
}

/// Restrict a stored entry to owner read/write.
pub async fn restrict_entry_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path).await?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
