//! Reading and writing one placement record file.
//!
//! Writes are atomic: the record goes to `<name>.tmp`, is fsynced, then
//! renamed over the live file.

use super::format::{FormatError, PlacementRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Path of the record inside a disk directory.
pub fn record_path(disk_dir: &Path, file_name: &str) -> PathBuf {
    disk_dir.join(file_name)
}

/// Whether a record file exists and can be opened and flushed.
///
/// Opening for write and syncing catches devices whose directory entry is
/// still cached after the device went away.
pub fn record_present(path: &Path) -> bool {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .and_then(|f| f.sync_all())
        .is_ok()
}

/// Read and validate a record.
pub fn read_record(path: &Path) -> Result<PlacementRecord, FormatError> {
    let buf = fs::read(path)?;
    PlacementRecord::from_bytes(&buf)
}

/// Atomically write a sealed record.
pub fn write_record(path: &Path, record: &PlacementRecord) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(&record.to_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}

/// Last modification time of a record file.
pub fn record_mtime(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = record_path(dir.path(), "SmSuperblock");
        assert!(!record_present(&path));

        let mut record = PlacementRecord::new();
        record.version = 9;
        record.seal();
        write_record(&path, &record).unwrap();

        assert!(record_present(&path));
        assert!(!path.with_extension("tmp").exists());
        let loaded = read_record(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_record(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, FormatError::Io(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = record_path(dir.path(), "SmSuperblock");
        fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(read_record(&path).is_err());
    }
}
