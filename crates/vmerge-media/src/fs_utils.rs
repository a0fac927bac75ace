//! Scratch file helpers.

use std::path::Path;
use tokio::fs;

/// Remove a file, ignoring a missing file and logging other failures.
pub async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Remove a directory tree. Returns whether the directory is gone afterwards.
pub async fn remove_dir_quietly(path: &Path) -> bool {
    match fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!("Failed to remove directory {}: {}", path.display(), e);
            false
        }
    }
}

/// Count regular files directly inside `dir`. A missing directory counts as empty.
pub async fn count_files(dir: &Path) -> usize {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return 0;
    };

    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            count += 1;
        }
    }
    count
}

/// Check that `dir` exists (creating it if needed) and accepts writes.
pub async fn ensure_writable_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let probe = dir.join(format!(".write-check-{}", std::process::id()));
    fs::write(&probe, b"ok").await?;
    fs::remove_file(&probe).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        fs::write(&file, b"x").await.unwrap();
        fs::create_dir(dir.path().join("sub")).await.unwrap();

        assert_eq!(count_files(dir.path()).await, 1);
        remove_quietly(&file).await;
        remove_quietly(&file).await;
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_remove_dir_and_writable_check() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("work").join("runs");
        ensure_writable_dir(&nested).await.unwrap();
        assert!(nested.exists());
        assert!(remove_dir_quietly(&nested).await);
        assert!(remove_dir_quietly(&nested).await);
        assert_eq!(count_files(&nested).await, 0);
    }
}
