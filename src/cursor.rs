//! Resumption cursor persistence
//!
//! The homeserver hands out an opaque batch token with every sync response.
//! Persisting it lets a restarted session resume where the previous one
//! stopped instead of replaying the backlog.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::Result;

/// Durable single-value store for the resumption cursor
pub trait CursorStore: Send + Sync {
    /// Load the stored cursor; `None` when absent or empty
    ///
    /// # Errors
    ///
    /// Returns error if the store exists but cannot be read
    fn load(&self) -> Result<Option<String>>;

    /// Replace the stored cursor
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be written
    fn save(&self, cursor: &str) -> Result<()>;

    /// Forget the stored cursor
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn clear(&self) -> Result<()> {
        self.save("")
    }
}

/// Cursor store backed by a single text file
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so readers never observe a partial token.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, cursor: &str) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(cursor.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::trace!(path = %self.path.display(), "resumption cursor written");
        Ok(())
    }
}
