//! File-backed persistence for the [`Ledger`].
//!
//! Reads and writes go through `cap-std` ambient directories. Every
//! read-modify-write cycle runs under an exclusive advisory lock on a sibling
//! `.lock` file so concurrent CLI invocations serialise on the ledger.

use std::fs::File;
use std::io::{self, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use super::Ledger;

/// Errors raised while reading or writing the ledger file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LedgerError {
    /// Raised when the ledger path has no file name component.
    #[error("ledger path {path} is missing a file name")]
    InvalidPath {
        /// Path supplied by the caller.
        path: Utf8PathBuf,
    },
    /// Raised when filesystem access fails.
    #[error("ledger io error at {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the in-memory ledger cannot be rendered as JSON.
    #[error("failed to serialise ledger {path}: {message}")]
    Serialize {
        /// Destination path.
        path: Utf8PathBuf,
        /// Serializer error message.
        message: String,
    },
    /// Raised when the advisory lock cannot be acquired.
    #[error("failed to lock ledger {path}: {message}")]
    Lock {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
}

/// Durable store for one provider's ledger document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LedgerStore {
    dir: Utf8PathBuf,
    file_name: String,
    retention: Duration,
}

impl LedgerStore {
    /// Creates a store for the ledger at `path`, pruning entries older than
    /// `retention` on every save.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidPath`] when `path` has no file name.
    pub fn new(path: &Utf8Path, retention: Duration) -> Result<Self, LedgerError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| LedgerError::InvalidPath {
                path: path.to_path_buf(),
            })?
            .to_owned();
        let dir = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."))
            .to_path_buf();
        Ok(Self {
            dir,
            file_name,
            retention,
        })
    }

    /// Full path of the ledger document.
    #[must_use]
    pub fn path(&self) -> Utf8PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Loads the ledger.
    ///
    /// A missing or empty file yields an empty ledger. A malformed file is
    /// moved aside to `<file>.corrupt` and also yields an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the file exists but cannot be read.
    pub fn load(&self) -> Result<Ledger, LedgerError> {
        let dir = match Dir::open_ambient_dir(&self.dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(err) => return Err(io_error(&self.dir, &err)),
        };

        let contents = match dir.read_to_string(&self.file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ledger::default()),
            Err(err) => return Err(io_error(&self.path(), &err)),
        };

        if contents.trim().is_empty() {
            return Ok(Ledger::default());
        }

        match serde_json::from_str::<Ledger>(&contents) {
            Ok(ledger) => Ok(ledger),
            Err(err) => {
                warn!(path = %self.path(), error = %err, "ledger is malformed, starting empty");
                self.quarantine(&dir);
                Ok(Ledger::default())
            }
        }
    }

    /// Prunes `ledger` and atomically replaces the file with its contents.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the directory cannot be created or the
    /// temporary file cannot be written and renamed into place.
    pub fn save(&self, ledger: &mut Ledger, now_millis: u64) -> Result<(), LedgerError> {
        let pruned = ledger.prune(now_millis, self.retention);
        if pruned > 0 {
            debug!(pruned, "pruned expired ledger entries");
        }

        let rendered =
            serde_json::to_string_pretty(ledger).map_err(|err| LedgerError::Serialize {
                path: self.path(),
                message: err.to_string(),
            })?;

        let dir = self.open_dir()?;
        let tmp_name = format!("{}.tmp", self.file_name);
        let tmp_path = self.dir.join(&tmp_name);
        let mut file = dir
            .create(&tmp_name)
            .map_err(|err| io_error(&tmp_path, &err))?;
        file.write_all(rendered.as_bytes())
            .map_err(|err| io_error(&tmp_path, &err))?;
        file.sync_all()
            .map_err(|err| io_error(&tmp_path, &err))?;
        drop(file);

        dir.rename(&tmp_name, &dir, &self.file_name)
            .map_err(|err| io_error(&self.path(), &err))
    }

    /// Runs `operation` against the ledger inside one locked
    /// load-mutate-save cycle.
    ///
    /// Nothing is written when `operation` fails.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or a [`LedgerError`] converted into
    /// `E` when locking, loading or saving fails.
    pub fn transaction<T, E, F>(&self, now_millis: u64, operation: F) -> Result<T, E>
    where
        E: From<LedgerError>,
        F: FnOnce(&mut Ledger) -> Result<T, E>,
    {
        let dir = self.open_dir()?;
        let lock = self.lock(&dir)?;
        let mut ledger = self.load()?;
        let value = operation(&mut ledger)?;
        self.save(&mut ledger, now_millis)?;
        drop(lock);
        Ok(value)
    }

    fn open_dir(&self) -> Result<Dir, LedgerError> {
        Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .map_err(|err| io_error(&self.dir, &err))?;
        Dir::open_ambient_dir(&self.dir, ambient_authority())
            .map_err(|err| io_error(&self.dir, &err))
    }

    fn lock(&self, dir: &Dir) -> Result<File, LedgerError> {
        let lock_name = format!("{}.lock", self.file_name);
        let lock_path = self.dir.join(&lock_name);
        let file = dir
            .create(&lock_name)
            .map_err(|err| LedgerError::Lock {
                path: lock_path.clone(),
                message: err.to_string(),
            })?
            .into_std();
        file.lock_exclusive().map_err(|err| LedgerError::Lock {
            path: lock_path,
            message: err.to_string(),
        })?;
        Ok(file)
    }

    fn quarantine(&self, dir: &Dir) {
        let corrupt_name = format!("{}.corrupt", self.file_name);
        if let Err(err) = dir.rename(&self.file_name, dir, &corrupt_name) {
            warn!(path = %self.path(), error = %err, "failed to move malformed ledger aside");
        }
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
