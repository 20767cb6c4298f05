//! Append-only JSON-lines files.
//!
//! Shared by the audit log and the violation tracker. Each record is one
//! line; an append returns only after the line has been flushed and synced.
//! A failed append is rolled back to the last committed length, so a retry
//! never duplicates or tears a record. A torn final line (crash mid-write)
//! is skipped on load and trimmed when the file is reopened for appending;
//! a corrupt line anywhere else is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write handle plus the length of everything known to be durable.
#[derive(Debug)]
struct Appender {
    file: File,
    committed: u64,
}

/// A JSON-lines file opened for appending.
#[derive(Debug)]
pub struct JsonlFile {
    path: PathBuf,
    appender: Mutex<Appender>,
    #[cfg(test)]
    sync_failures: std::sync::atomic::AtomicU32,
}

impl JsonlFile {
    /// Open (creating if needed) the file and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JsonlError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| JsonlError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let contents = fs::read(&path).map_err(io_err)?;
        let committed = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1) as u64;
        if committed < contents.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = contents.len() as u64 - committed,
                "Trimming torn trailing record"
            );
            file.set_len(committed).map_err(io_err)?;
        }

        Ok(Self {
            path,
            appender: Mutex::new(Appender { file, committed }),
            #[cfg(test)]
            sync_failures: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk.
    ///
    /// On error the file is truncated back to its committed length, so the
    /// record is either fully durable or absent.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), JsonlError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut appender = self.appender.lock().unwrap_or_else(PoisonError::into_inner);
        let Appender { file, committed } = &mut *appender;

        match self.write_line(file, *committed, &line) {
            Ok(()) => {
                *committed += line.len() as u64;
                Ok(())
            }
            Err(source) => {
                // A leftover tail is also trimmed before the next write.
                if let Err(e) = file.set_len(*committed) {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to roll back partial append"
                    );
                }
                Err(JsonlError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    fn write_line(&self, file: &mut File, committed: u64, line: &[u8]) -> io::Result<()> {
        if file.metadata()?.len() != committed {
            file.set_len(committed)?;
        }
        file.write_all(line)?;
        self.sync(file)
    }

    fn sync(&self, file: &File) -> io::Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .sync_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(io::Error::new(io::ErrorKind::Other, "simulated sync failure"));
            }
        }
        file.sync_data()
    }

    /// Make the next `n` syncs fail after the line has been written.
    #[cfg(test)]
    pub(crate) fn fail_next_syncs(&self, n: u32) {
        self.sync_failures.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Read every complete record in file order.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, JsonlError> {
        read_all(&self.path)
    }
}

/// Read every complete record of a JSON-lines file without opening it for writing.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, JsonlError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(JsonlError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|source| JsonlError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let last = lines.len().saturating_sub(1);
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if idx == last => {
                tracing::warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping torn trailing record");
            }
            Err(source) => {
                return Err(JsonlError::Corrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    source,
                })
            }
        }
    }
    Ok(records)
}
