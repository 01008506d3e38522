//! Resume marker persisted between agent runs
//!
//! The marker file holds a single epoch-seconds value. Its modification time
//! doubles as the agent's heartbeat: the watchdog restarts the agent when the
//! file stops being touched.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("failed to write resume marker `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read resume marker metadata `{path}`: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Monotonic resume position backed by a file
#[derive(Debug, Clone)]
pub struct ResumeMarker {
    path: PathBuf,
    value: i64,
}

impl ResumeMarker {
    /// Read the stored value. A missing or unreadable file starts from 0.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = match std::fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<i64>() {
                Ok(value) => value,
                Err(_) => {
                    warn!(path = %path.display(), "Resume marker is not a number, starting from 0");
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read resume marker, starting from 0");
                0
            }
        };
        Self { path, value }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// `since` for new log subscriptions; 0 means read the full history
    pub fn since(&self) -> Option<i64> {
        (self.value > 0).then_some(self.value)
    }

    /// Persist `value` unless it would move the marker backwards. The file is
    /// rewritten either way so its mtime keeps advancing.
    pub async fn store(&mut self, value: i64) -> Result<(), MarkerError> {
        self.value = self.value.max(value);
        tokio::fs::write(&self.path, format!("{}\n", self.value))
            .await
            .map_err(|source| MarkerError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), since = self.value, "Resume marker updated");
        Ok(())
    }
}

/// Create the marker file with value 0 if none exists, so its mtime can be
/// watched before the agent first writes it.
pub fn ensure_exists(path: &Path) -> Result<(), MarkerError> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path);
    let result = match file {
        Ok(mut file) => file.write_all(b"0\n"),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|source| MarkerError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Last modification time of the marker file
pub fn modified(path: &Path) -> Result<SystemTime, MarkerError> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|source| MarkerError::Metadata {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_and_invalid() {
        let dir = TempDir::new().unwrap();
        let missing = ResumeMarker::load(dir.path().join("since"));
        assert_eq!(missing.value(), 0);
        assert_eq!(missing.since(), None);

        let bad = dir.path().join("bad");
        std::fs::write(&bad, "yesterday\n").unwrap();
        assert_eq!(ResumeMarker::load(&bad).value(), 0);
    }

    #[tokio::test]
    async fn test_store_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("since");

        let mut marker = ResumeMarker::load(&path);
        marker.store(1449100442).await.unwrap();
        marker.store(1449100000).await.unwrap();
        assert_eq!(marker.value(), 1449100442);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1449100442\n");

        let reloaded = ResumeMarker::load(&path);
        assert_eq!(reloaded.since(), Some(1449100442));
    }

    #[tokio::test]
    async fn test_store_refreshes_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("since");
        ensure_exists(&path).unwrap();
        let before = modified(&path).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut marker = ResumeMarker::load(&path);
        marker.store(0).await.unwrap();

        assert!(modified(&path).unwrap() > before);
    }

    #[test]
    fn test_ensure_exists_keeps_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("since");
        ensure_exists(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n");

        std::fs::write(&path, "42\n").unwrap();
        ensure_exists(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "42\n");
        assert!(modified(&dir.path().join("absent")).is_err());
    }
}
