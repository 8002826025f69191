//! Snapshot files
//!
//! Files hold exactly one binary snapshot, named `snapshot_<millis>.cs4`.

use super::codec::{read_snapshot, write_snapshot};
use super::model::Snapshot;
use crate::domain::SnapshotError;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE_EXTENSION: &str = "cs4";

/// File name used when saving `snapshot` without an explicit path
#[must_use]
pub fn default_file_name(snapshot: &Snapshot) -> String {
    format!("snapshot_{}.{SNAPSHOT_FILE_EXTENSION}", snapshot.timestamp_ms())
}

/// Write `snapshot` to `path`, replacing any existing file.
///
/// # Errors
/// File creation or encoding failures.
pub fn save(snapshot: &Snapshot, path: &Path) -> Result<(), SnapshotError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_snapshot(&mut writer, snapshot)?;
    writer.flush()?;
    Ok(())
}

/// Write `snapshot` under its default name inside `dir`.
///
/// # Errors
/// See [`save`].
pub fn save_in(snapshot: &Snapshot, dir: &Path) -> Result<PathBuf, SnapshotError> {
    let path = dir.join(default_file_name(snapshot));
    save(snapshot, &path)?;
    Ok(path)
}

/// # Errors
/// Missing file or malformed contents.
pub fn load(path: &Path) -> Result<Snapshot, SnapshotError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_snapshot(&mut reader)
}
