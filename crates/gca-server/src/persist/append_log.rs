//! A fixed-width, append-only record log. Used for
//! `equipment-authorizations.dat` and `equipment-reports.dat`: every
//! operation either fully lands on disk before the matching in-memory
//! mutation is observed by another thread, or (on I/O failure) neither
//! does, per §5's ordering guarantee.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use gca_core::error::Result;

pub struct AppendLog {
    file: File,
    path: PathBuf,
    record_size: usize,
}

impl AppendLog {
    pub fn open(path: &Path, record_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(AppendLog {
            file,
            path: path.to_path_buf(),
            record_size,
        })
    }

    /// Append one fixed-width record, flushing to disk before returning.
    /// Failure here must be observed by the caller *before* it mutates
    /// any in-memory state (§4.2 / §5).
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        debug_assert_eq!(record.len(), self.record_size);
        self.file.write_all(record)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete record currently on disk, in file order. A
    /// trailing partial record (a torn write from a crash mid-append) is
    /// dropped rather than treated as an error — the record it belongs
    /// to never reached a consistent state.
    pub fn replay(path: &Path, record_size: usize) -> Result<Vec<Vec<u8>>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let whole_records = buf.len() / record_size;
        let mut out = Vec::with_capacity(whole_records);
        for i in 0..whole_records {
            out.push(buf[i * record_size..(i + 1) * record_size].to_vec());
        }
        Ok(out)
    }

    /// Rewrite the log to contain exactly `records`, used by ring
    /// rotation to drop the archived week from the live log.
    pub fn rewrite(path: &Path, record_size: usize, records: &[Vec<u8>]) -> Result<Self> {
        let tmp_path = path.with_extension("rewrite.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            for record in records {
                debug_assert_eq!(record.len(), record_size);
                tmp.write_all(record)?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Self::open(path, record_size)
    }
}

/// Archive every record in `path` that `predicate` accepts into
/// `archive_path` (append order preserved), then rewrite `path` to retain
/// only the records `predicate` rejected. Used by ring rotation (§4.3) to
/// move one device's oldest week out of the shared report log while
/// leaving every other device's (and this device's own newer) records in
/// place. Returns the number of archived records.
pub fn archive_matching(
    path: &Path,
    archive_path: &Path,
    record_size: usize,
    mut predicate: impl FnMut(&[u8]) -> bool,
) -> Result<usize> {
    let all = AppendLog::replay(path, record_size)?;
    let mut archived = Vec::new();
    let mut remaining = Vec::new();
    for record in all {
        if predicate(&record) {
            archived.push(record);
        } else {
            remaining.push(record);
        }
    }
    if !archived.is_empty() {
        let mut archive_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(archive_path)?;
        for record in &archived {
            archive_file.write_all(record)?;
        }
        archive_file.sync_all()?;
    }
    AppendLog::rewrite(path, record_size, &remaining)?;
    Ok(archived.len())
}
