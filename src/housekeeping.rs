//! Periodic removal of stale files from the output directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deletes regular files directly inside `directory` whose modification
/// time is more than `max_age_hours` in the past. Subdirectories are left
/// alone. Returns the number of files deleted.
///
/// Files that vanish or cannot be removed mid-scan are logged and skipped.
pub fn cleanup(directory: &Path, max_age_hours: u64) -> io::Result<usize> {
    let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete stale file"),
        }
    }

    info!("Cleaned up {} old files from {}", deleted, directory.display());
    Ok(deleted)
}

/// Runs [`cleanup`] every `interval` until `shutdown` is cancelled.
///
/// The first pass happens immediately. Failures never stop the loop.
pub async fn run_periodic(
    directory: PathBuf,
    max_age_hours: u64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        directory = %directory.display(),
        max_age_hours,
        interval_secs = interval.as_secs(),
        "Housekeeping scheduled"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let dir = directory.clone();
        match tokio::task::spawn_blocking(move || cleanup(&dir, max_age_hours)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(directory = %directory.display(), error = %e, "Cleanup task failed"),
            Err(e) => error!(directory = %directory.display(), error = %e, "Cleanup task panicked"),
        }
    }
    debug!("Housekeeping stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_deletes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let old = touch(dir.path(), "old.pdf", 25 * HOUR);
        let fresh = touch(dir.path(), "fresh.pdf", HOUR);

        assert_eq!(cleanup(dir.path(), 24).unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_not_recursive() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let inner = touch(&nested, "old.pdf", 48 * HOUR);

        assert_eq!(cleanup(dir.path(), 24).unwrap(), 0);
        assert!(inner.exists());
        assert!(nested.exists());
    }

    #[test]
    fn test_zero_age_deletes_everything_older() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.pdf", Duration::from_secs(10));
        touch(dir.path(), "b.pdf", Duration::from_secs(10));

        assert_eq!(cleanup(dir.path(), 0).unwrap(), 2);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(cleanup(&dir.path().join("missing"), 24).is_err());
    }

    #[tokio::test]
    async fn test_periodic_runs_immediately_and_stops() {
        let dir = TempDir::new().unwrap();
        let old = touch(dir.path(), "old.pdf", 25 * HOUR);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(
            dir.path().to_path_buf(),
            24,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while old.exists() {
            assert!(std::time::Instant::now() < deadline, "first pass never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
