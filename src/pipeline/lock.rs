//! Coordination between processes working on the same project.
//!
//! Whichever process runs a project holds an exclusive lock on its `.lock`
//! file for as long as the run lasts. The OS drops the lock when the file is
//! closed, including when the process dies, so a project whose record says
//! it is running but whose lock is free was interrupted.
//!
//! Other processes can't reach the runner's memory, so they ask it to pause
//! or cancel by writing a one-word request into the project's `control`
//! file. The runner polls for it.

use std::{
    fs::{File, OpenOptions, TryLockError},
    io,
    time::Duration,
};

use tokio::time::sleep;

use crate::{
    async_utils::{
        io::{read_optional, write_atomic},
        spawn_blocking_propagating_panics,
    },
    error::StorageError,
    prelude::*,
    project::ProjectPaths,
};

use super::runner::RunSignal;

/// How often runners check for requests, and waiters check the lock.
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// An exclusive claim on a project. Released when dropped.
#[derive(Debug)]
pub struct ProjectLock {
    _file: File,
}

impl ProjectLock {
    /// Take the lock, or return `None` if another holder has it.
    ///
    /// Locks belong to open files, so a second attempt from this process
    /// fails too.
    pub async fn try_acquire(paths: &ProjectPaths) -> Result<Option<Self>, StorageError> {
        let path = paths.lock_path();
        spawn_blocking_propagating_panics(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|err| StorageError::new("open lock file", &path, err))?;
            match file.try_lock() {
                Ok(()) => Ok(Some(Self { _file: file })),
                Err(TryLockError::WouldBlock) => Ok(None),
                Err(TryLockError::Error(err)) => {
                    Err(StorageError::new("lock", &path, err))
                }
            }
        })
        .await
    }

    /// Ask the current holder to stop, and wait until we can take the lock.
    ///
    /// The request is written again if it disappears, which happens when
    /// the holder starts a new run before we get our turn.
    pub async fn request_and_acquire(
        paths: &ProjectPaths,
        signal: RunSignal,
    ) -> Result<Self, StorageError> {
        request(paths, signal).await?;
        loop {
            if let Some(lock) = Self::try_acquire(paths).await? {
                return Ok(lock);
            }
            if read_request(paths).await?.is_none() {
                request(paths, signal).await?;
            }
            sleep(CONTROL_POLL_INTERVAL).await;
        }
    }
}

/// Leave a request for the process running this project.
pub async fn request(paths: &ProjectPaths, signal: RunSignal) -> Result<(), StorageError> {
    let word = match signal {
        RunSignal::Continue => return clear_requests(paths).await,
        RunSignal::Pause => "pause",
        RunSignal::Cancel => "cancel",
    };
    debug!(path = %paths.control_path().display(), word, "Requesting stop");
    write_atomic(&paths.control_path(), word.as_bytes().to_vec()).await
}

/// The pending request, if any. Unknown words are ignored.
pub async fn read_request(paths: &ProjectPaths) -> Result<Option<RunSignal>, StorageError> {
    let Some(data) = read_optional(&paths.control_path()).await? else {
        return Ok(None);
    };
    match String::from_utf8_lossy(&data).trim() {
        "pause" => Ok(Some(RunSignal::Pause)),
        "cancel" => Ok(Some(RunSignal::Cancel)),
        other => {
            warn!(request = other, "Ignoring unknown control request");
            Ok(None)
        }
    }
}

/// Forget any pending request.
pub async fn clear_requests(paths: &ProjectPaths) -> Result<(), StorageError> {
    let path = paths.control_path();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::new("remove", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "book");
        tokio::fs::create_dir_all(paths.folder()).await?;

        let lock = ProjectLock::try_acquire(&paths).await?.unwrap();
        assert!(ProjectLock::try_acquire(&paths).await?.is_none());
        drop(lock);
        assert!(ProjectLock::try_acquire(&paths).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn requests_are_written_read_and_cleared() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "book");

        assert_eq!(read_request(&paths).await?, None);
        request(&paths, RunSignal::Pause).await?;
        assert_eq!(read_request(&paths).await?, Some(RunSignal::Pause));
        request(&paths, RunSignal::Cancel).await?;
        assert_eq!(read_request(&paths).await?, Some(RunSignal::Cancel));
        clear_requests(&paths).await?;
        clear_requests(&paths).await?;
        assert_eq!(read_request(&paths).await?, None);

        tokio::fs::write(paths.control_path(), b"\xff\xfe").await?;
        assert_eq!(read_request(&paths).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn waiters_get_the_lock_once_the_holder_stops() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "book");
        tokio::fs::create_dir_all(paths.folder()).await?;
        let held = ProjectLock::try_acquire(&paths).await?.unwrap();

        let holder_paths = paths.clone();
        let holder = tokio::spawn(async move {
            while read_request(&holder_paths).await.unwrap() != Some(RunSignal::Cancel) {
                sleep(Duration::from_millis(10)).await;
            }
            drop(held);
        });
        let lock = tokio::time::timeout(
            Duration::from_secs(5),
            ProjectLock::request_and_acquire(&paths, RunSignal::Cancel),
        )
        .await??;
        holder.await?;
        assert!(ProjectLock::try_acquire(&paths).await?.is_none());
        drop(lock);
        Ok(())
    }
}
