//! I/O utilities.
//!
//! Everything the pipeline persists (page records, project metadata, the
//! whole-document artifacts) goes through [`write_atomic`], so that a reader
//! sees either the old file or the complete new file, never a torn write.

use std::io::{self, Write as _};

use tempfile::NamedTempFile;
use tokio::{fs, io::AsyncWrite};

use super::spawn_blocking_propagating_panics;
use crate::{error::StorageError, prelude::*};

/// Atomically replace `path` with `data`.
///
/// We write to a temporary file in the same directory, flush it to disk, and
/// then rename it over the destination. Because the rename happens within a
/// single directory, it is atomic on the filesystems we care about. If we are
/// killed part way through, the only thing left behind is a stray temporary
/// file, which readers ignore.
pub async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<(), StorageError> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || write_atomic_sync(&path, &data)).await
}

/// Blocking implementation of [`write_atomic`].
fn write_atomic_sync(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().ok_or_else(|| {
        StorageError::new(
            "find parent directory of",
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    std::fs::create_dir_all(dir)
        .map_err(|err| StorageError::new("create directory", dir, err))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|err| StorageError::new("create temporary file in", dir, err))?;
    write_and_sync(&mut tmp, data)
        .map_err(|err| StorageError::new("write temporary file for", path, err))?;
    tmp.persist(path)
        .map_err(|err| StorageError::new("publish", path, err.error))?;
    sync_dir(dir).map_err(|err| StorageError::new("sync directory", dir, err))?;
    Ok(())
}

/// Flush a directory's entries to disk, so that a rename into it survives a
/// power failure.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

/// Windows can't open directories as files, and commits renames itself.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Write all of `data` and make sure it has reached the disk.
fn write_and_sync(tmp: &mut NamedTempFile, data: &[u8]) -> io::Result<()> {
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()
}

/// Read a file's raw bytes, returning `None` if it does not exist.
///
/// Decoding is left to the caller, so that garbage in a file is a parse
/// problem rather than an I/O error.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::new("read", path, err)),
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_replaces() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("a/b/out.txt");
        write_atomic(&path, b"first".to_vec()).await?;
        write_atomic(&path, b"second".to_vec()).await?;
        assert_eq!(read_optional(&path).await?.as_deref(), Some(&b"second"[..]));

        // Nothing but the published file is left in the directory.
        let names = std::fs::read_dir(path.parent().unwrap())?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        assert_eq!(names, vec![std::ffi::OsString::from("out.txt")]);
        Ok(())
    }

    #[tokio::test]
    async fn read_optional_returns_bytes_that_are_not_utf8() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"\xff\xfe")?;
        assert_eq!(read_optional(&path).await?, Some(vec![0xff, 0xfe]));
        Ok(())
    }

    #[test]
    fn sync_dir_flushes_existing_directories() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        sync_dir(dir.path())?;
        #[cfg(unix)]
        assert!(sync_dir(&dir.path().join("missing")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn read_optional_handles_missing_files() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        assert_eq!(read_optional(&dir.path().join("missing")).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_reports_storage_errors() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        // A regular file where a directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x")?;
        let err = write_atomic(&blocker.join("out.txt"), b"data".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.action, "create directory");
        Ok(())
    }
}
