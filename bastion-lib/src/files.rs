//! File helpers for documents exchanged through drop directories.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Write `contents` to `path` by writing a sibling temp file and renaming it,
/// so readers never observe a partially written document.
pub async fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = temp_path_for(path);
    tokio::fs::write(&temp_path, contents).await?;

    #[cfg(windows)]
    {
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
    }

    tokio::fs::rename(&temp_path, path).await?;
    debug!(file = %path.display(), "Wrote file");
    Ok(())
}

/// Blocking variant of [`write_atomically`] for drop-time persistence.
pub fn write_atomically_blocking(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = temp_path_for(path);
    std::fs::write(&temp_path, contents)?;

    #[cfg(windows)]
    {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }

    std::fs::rename(&temp_path, path)
}

/// Read a file, retrying while it is not yet readable.
///
/// Drop-directory writers and the notification that a file exists can race;
/// `attempts` bounds the wait to `attempts - 1` sleeps of `delay`.
pub async fn read_with_retry(path: &Path, attempts: u32, delay: Duration) -> std::io::Result<String> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => return Ok(contents),
            Err(e) if attempt < attempts => {
                debug!(file = %path.display(), attempt, error = %e, "File not readable yet, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_atomically_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("status.xml");

        write_atomically(&path, "first").await.unwrap();
        write_atomically(&path, "second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn read_with_retry_waits_for_late_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.xml");

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::write(writer_path, "<policy/>").unwrap();
        });

        let contents = read_with_retry(&path, 3, Duration::from_millis(50))
            .await
            .expect("file appears before the last attempt");
        assert_eq!(contents, "<policy/>");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_with_retry_gives_up() {
        let dir = TempDir::new().unwrap();
        let result = read_with_retry(&dir.path().join("never.xml"), 2, Duration::from_millis(1)).await;
        assert!(result.is_err());
    }
}
