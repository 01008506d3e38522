//! JSON-lines file sink with time and size based rotation

use super::{Sink, SinkError};
use crate::models::NormalizedRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    pub path: PathBuf,
    /// Rotate once the current file has been open this long
    pub rotate_after: Duration,
    /// Rotate once the current file reaches this size
    pub rotate_bytes: u64,
    /// Rotated files older than this are removed
    pub keep: Duration,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/srv/events/containers.log"),
            rotate_after: Duration::from_secs(60),
            rotate_bytes: 1024 * 1024,
            keep: Duration::from_secs(3600),
        }
    }
}

struct OpenFile {
    file: File,
    opened_at: SystemTime,
    size: u64,
}

pub struct FileSink {
    config: FileSinkConfig,
    current: Option<OpenFile>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    async fn open(&mut self) -> Result<&mut OpenFile, SinkError> {
        let open = match self.current.take() {
            Some(open) => open,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.config.path)
                    .await?;
                let size = file.metadata().await?.len();
                debug!(path = %self.config.path.display(), size, "Opened record log");
                OpenFile {
                    file,
                    opened_at: SystemTime::now(),
                    size,
                }
            }
        };
        Ok(self.current.insert(open))
    }

    fn rotation_due(&self) -> bool {
        let Some(open) = &self.current else {
            return false;
        };
        if open.size == 0 {
            return false;
        }
        let age = open.opened_at.elapsed().unwrap_or_default();
        open.size >= self.config.rotate_bytes || age >= self.config.rotate_after
    }

    async fn rotate(&mut self) -> Result<(), SinkError> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        open.file.flush().await?;
        drop(open);

        let modified = fs::metadata(&self.config.path).await?.modified()?;
        let target = rotated_path(&self.config.path, modified);
        fs::rename(&self.config.path, &target).await?;
        info!(
            path = %self.config.path.display(),
            rotated = %target.display(),
            "Rotated record log"
        );

        self.prune().await;
        Ok(())
    }

    /// Remove rotated files past the retention window. Failures only warn.
    async fn prune(&self) {
        let Some(dir) = self.config.path.parent() else {
            return;
        };
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        let Some(prefix) = self
            .config
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| format!("{n}-"))
        else {
            return;
        };

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to list rotated record logs");
                return;
            }
        };

        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= self.config.keep {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!(file = %name, "Removed expired record log"),
                    Err(e) => warn!(file = %name, error = %e, "Failed to remove record log"),
                }
            }
        }
    }
}

/// `<path>-YYYYMMDDHHMMSS` in UTC, suffixed with a counter if taken
fn rotated_path(path: &Path, modified: SystemTime) -> PathBuf {
    let stamp = DateTime::<Utc>::from(modified).format("%Y%m%d%H%M%S");
    let base = format!("{}-{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{n}"));
        n += 1;
    }
    candidate
}

#[async_trait]
impl Sink for FileSink {
    async fn emit(&mut self, records: &[NormalizedRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        if self.rotation_due() {
            self.rotate().await?;
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let open = self.open().await?;
        if let Err(e) = open.file.write_all(&buf).await {
            // Reopen on the next batch
            self.current = None;
            return Err(e.into());
        }
        open.file.flush().await?;
        open.size += buf.len() as u64;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(service: &str) -> NormalizedRecord {
        NormalizedRecord {
            time: 1449100442,
            kind: RecordKind::Log,
            state: "ok".to_string(),
            service: service.to_string(),
            tags: Vec::new(),
            ttl: 60,
            attributes: BTreeMap::from([("log".to_string(), "HERE".to_string())]),
            metric: None,
        }
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.log");
        let mut sink = FileSink::new(FileSinkConfig {
            path: path.clone(),
            ..Default::default()
        });

        sink.emit(&[record("container foo stdout"), record("container foo stderr")])
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<NormalizedRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].service, "container foo stderr");
        assert_eq!(lines[0].attribute("log"), Some("HERE"));
        assert_eq!(sink.name(), "file");
    }

    #[tokio::test]
    async fn test_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.log");
        let mut sink = FileSink::new(FileSinkConfig {
            path: path.clone(),
            rotate_bytes: 10,
            ..Default::default()
        });

        sink.emit(&[record("first")]).await.unwrap();
        sink.emit(&[record("second")]).await.unwrap();

        let names = files(dir.path());
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "containers.log");
        assert!(names[1].starts_with("containers.log-"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("second"));
    }

    #[tokio::test]
    async fn test_prunes_expired_rotations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.log");
        let mut sink = FileSink::new(FileSinkConfig {
            path: path.clone(),
            rotate_after: Duration::ZERO,
            keep: Duration::ZERO,
            ..Default::default()
        });

        sink.emit(&[record("first")]).await.unwrap();
        sink.emit(&[record("second")]).await.unwrap();

        assert_eq!(files(dir.path()), vec!["containers.log".to_string()]);
    }

    #[test]
    fn test_rotated_path_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.log");
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1449100442);

        let rotated = rotated_path(&path, at);
        assert_eq!(
            rotated.file_name().unwrap().to_str().unwrap(),
            "containers.log-20151202235402"
        );

        std::fs::write(&rotated, "").unwrap();
        let second = rotated_path(&path, at);
        assert!(second.to_str().unwrap().ends_with("-20151202235402.1"));
    }
}
