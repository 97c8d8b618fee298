use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use tracing::*;

use crate::{error::EngineError, job::Job};

const STATE_FILE: &str = "jobs_state.json";

/// Atomic JSON persistence of the whole jobs map.
///
/// Every save serialises the full `{job_id: job}` document to a
/// sibling `.tmp` file and renames it over the live one, so readers
/// only ever observe a complete document. `BTreeMap` keying keeps
/// repeated snapshots of unchanged state byte-identical.
#[derive(Clone, Debug)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    /// Opens the store in the platform's per-user data directory,
    /// creating it if needed.
    pub fn open_default() -> Result<Self, EngineError> {
        let dirs = ProjectDirs::from("", "", "abcmint-mixer").ok_or_else(|| {
            EngineError::Store(io::Error::other("no usable home directory"))
        })?;
        let dir = dirs.data_dir();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(STATE_FILE),
        })
    }

    /// Opens the store at an explicit path.
    pub fn at_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted jobs map. A missing file is an empty map;
    /// a present but unreadable file is an error.
    pub fn load(&self) -> Result<BTreeMap<String, Job>, EngineError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let jobs: BTreeMap<String, Job> = serde_json::from_slice(&raw)?;
        trace!(count = jobs.len(), path = %self.path.display(), "loaded job state");
        Ok(jobs)
    }

    /// Serialises and atomically replaces the state file.
    pub fn save(&self, jobs: &BTreeMap<String, Job>) -> Result<(), EngineError> {
        let raw = serde_json::to_vec(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
