//! Periodic removal of old job log files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Delete `*.log` files under `dir` last modified more than `max_age` ago.
///
/// Returns how many files were removed.
pub async fn sweep_once(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(crate::JOB_LOG_EXTENSION) {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified < cutoff && tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Sweep `dir` hourly until `cancel` fires. A zero `days` disables sweeping.
pub fn spawn_sweeper(dir: PathBuf, days: u32, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    if days == 0 {
        return None;
    }
    let max_age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    Some(tokio::spawn(async move {
        ::tracing::info!(dir = %dir.display(), days, "job log sweeper started");
        loop {
            match sweep_once(&dir, max_age).await {
                Ok(0) => {}
                Ok(removed) => ::tracing::info!(dir = %dir.display(), removed, "swept old job logs"),
                Err(e) => ::tracing::warn!(dir = %dir.display(), error = %e, "job log sweep failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
        }
        ::tracing::info!("job log sweeper stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_files_survive_and_other_extensions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(sweep_once(dir.path(), Duration::from_secs(3600)).await.unwrap(), 0);
        // Zero max age: every log file is already too old.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sweep_once(dir.path(), Duration::ZERO).await.unwrap(), 1);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let removed = sweep_once(Path::new("/definitely/not/here"), Duration::ZERO).await.unwrap();
        assert_eq!(removed, 0);
    }
}
