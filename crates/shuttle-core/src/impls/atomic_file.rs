//! Atomic JSON file writes.
//!
//! Every record is written to a staging file in the same filesystem, fsynced,
//! and renamed onto its visible path. A reader of the visible path sees either
//! the previous complete record or the new complete record, never a partial
//! one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use ulid::Ulid;

use crate::domain::{ShuttleError, ShuttleResult};

pub(crate) fn write_json_atomic<T: Serialize>(
    staging_dir: &Path,
    target: &Path,
    value: &T,
) -> ShuttleResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;

    fs::create_dir_all(staging_dir).map_err(ShuttleError::store)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(ShuttleError::store)?;
    }

    let tmp_path = staging_dir.join(format!("{}.tmp", Ulid::new()));
    let written = write_and_sync(&tmp_path, &bytes).and_then(|()| fs::rename(&tmp_path, target));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(ShuttleError::store(format!(
            "atomic write to {} failed: {e}",
            target.display()
        )));
    }
    Ok(())
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// ロックファイルへの排他 lock。drop で解放される
///
/// 別プロセスも同じパスを lock するので、同じ root を開いた store 同士の
/// read-modify-write がこれで直列化される。blocking なので spawn_blocking の中で使う。
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> ShuttleResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ShuttleError::store)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ShuttleError::store(format!("open lock {} failed: {e}", path.display())))?;
        file.lock_exclusive()
            .map_err(|e| ShuttleError::store(format!("lock {} failed: {e}", path.display())))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // close でも解放されるが明示しておく
        let _ = FileExt::unlock(&self.file);
    }
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> ShuttleResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ShuttleError::store(format!(
            "read {} failed: {e}",
            path.display()
        ))),
    }
}

/// `*.json` files directly inside `dir`. A missing directory is empty.
pub(crate) fn json_files(dir: &Path) -> ShuttleResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ShuttleError::store(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(ShuttleError::store)?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Remove staging leftovers from writers that died between write and rename.
pub(crate) fn sweep_staging(staging_dir: &Path, older_than: Duration) -> ShuttleResult<usize> {
    let entries = match fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ShuttleError::store(e)),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= older_than);
        if expired && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
