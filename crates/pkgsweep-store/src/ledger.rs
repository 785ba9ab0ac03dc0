use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use pkgsweep::{Counters, Cursor, PackageRef, ProgressEntry, ProgressState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Ledger format version written by this build. Older or newer files are rejected.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors specific to ledger persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger at {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("unsupported ledger schema version {found} (expected {SCHEMA_VERSION})")]
    UnsupportedSchema { found: u32 },

    #[error("invalid package key in ledger: {0:?}")]
    InvalidKey(String),

    #[error("could not serialize ledger: {0}")]
    Serialize(String),
}

/// On-disk shape of the ledger.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LedgerDocument {
    schema_version: u32,
    started_at: u64,
    updated_at: u64,
    #[serde(default)]
    cursor: Option<Cursor>,
    /// Written for readers of the file; recomputed from entries on load.
    counters: Counters,
    entries: BTreeMap<String, ProgressEntry>,
}

impl LedgerDocument {
    fn from_state(state: &ProgressState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            started_at: state.started_at(),
            updated_at: state.updated_at(),
            cursor: state.cursor(),
            counters: state.counters(),
            entries: state
                .entries()
                .map(|(package, entry)| (package.key(), entry.clone()))
                .collect(),
        }
    }

    fn into_state(self) -> Result<ProgressState, LedgerError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(LedgerError::UnsupportedSchema {
                found: self.schema_version,
            });
        }

        let mut entries = BTreeMap::new();
        for (key, entry) in self.entries {
            let package = PackageRef::parse_key(&key).ok_or(LedgerError::InvalidKey(key))?;
            entries.insert(package, entry);
        }

        Ok(ProgressState::from_parts(
            entries,
            self.cursor,
            self.started_at,
            self.updated_at,
        ))
    }
}

/// Read the ledger at `path`.
///
/// Returns an empty state when `resume` is false or no file exists yet. An
/// existing file that cannot be parsed is an error, never silently replaced.
pub fn load(path: &Path, resume: bool) -> Result<ProgressState, LedgerError> {
    if !resume {
        return Ok(ProgressState::default());
    }
    Ok(read(path)?.unwrap_or_default())
}

/// Read the ledger at `path` if there is one.
pub fn read(path: &Path) -> Result<Option<ProgressState>, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };

    let document: LedgerDocument =
        serde_json::from_slice(&bytes).map_err(|e| LedgerError::Malformed {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;

    let state = document.into_state()?;
    info!(path = %path.display(), entries = state.len(), "loaded ledger");
    Ok(Some(state))
}

/// Atomically replace the ledger at `path` with `state`.
///
/// Writes a sibling temp file, flushes it to disk, then renames it over the
/// target. Readers see either the old ledger or the new one.
pub fn checkpoint(state: &ProgressState, path: &Path) -> Result<(), LedgerError> {
    let io_err = |source| LedgerError::Io {
        path: path.to_owned(),
        source,
    };

    let payload = serde_json::to_vec_pretty(&LedgerDocument::from_state(state))
        .map_err(|e| LedgerError::Serialize(e.to_string()))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".progress-")
        .suffix(".json.tmp")
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(&payload).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    debug!(path = %path.display(), entries = state.len(), "ledger checkpointed");
    Ok(())
}

/// The ledger for one output location.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, resume: bool) -> Result<ProgressState, LedgerError> {
        load(&self.path, resume)
    }

    pub fn read(&self) -> Result<Option<ProgressState>, LedgerError> {
        read(&self.path)
    }

    pub fn checkpoint(&self, state: &ProgressState) -> Result<(), LedgerError> {
        checkpoint(state, &self.path)
    }
}
