//! On-disk review project
//!
//! A project is a directory named after its id:
//!
//! ```text
//! <projects_root>/<project_id>/
//!     project.json   cycle descriptor, prior and stopping settings
//!     records.json   the dataset
//!     state.db       labeling state
//!     error.json     written when the last job failed
//! ```

use crate::cycle::CycleDescriptor;
use crate::error::{Result, SiftError};
use crate::models::Record;
use crate::simulation::PriorSettings;
use crate::state::State;
use crate::stopping::StoppingSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE: &str = "project.json";
pub const RECORDS_FILE: &str = "records.json";
pub const STATE_FILE: &str = "state.db";
pub const ERROR_FILE: &str = "error.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub cycle: CycleDescriptor,
    pub priors: PriorSettings,
    /// Stopping policy for simulations
    pub stopping: StoppingSpec,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        self.cycle.validate()?;
        self.stopping.validate()
    }
}

/// Failure recorded against a project by the last job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectError {
    pub category: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl From<&SiftError> for ProjectError {
    fn from(err: &SiftError) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    dir: PathBuf,
    config: ProjectConfig,
}

impl Project {
    /// Create the project directory and write its configuration
    pub fn create(dir: impl Into<PathBuf>, config: ProjectConfig) -> Result<Self> {
        let dir = dir.into();
        config.validate()?;
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(CONFIG_FILE), &config)?;
        Ok(Self { dir, config })
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(CONFIG_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| {
            SiftError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ProjectConfig = serde_json::from_str(&raw).map_err(|e| {
            SiftError::config(format!("malformed {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!(project = %dir.display(), "Opened project");
        Ok(Self { dir, config })
    }

    /// Directory name, used as the project id on the task manager
    pub fn id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn load_records(&self) -> Result<Vec<Record>> {
        let path = self.dir.join(RECORDS_FILE);
        let raw = fs::read_to_string(&path)?;
        let records: Vec<Record> = serde_json::from_str(&raw)?;
        Ok(records)
    }

    pub fn write_records(&self, records: &[Record]) -> Result<()> {
        write_json_atomic(&self.dir.join(RECORDS_FILE), &records)
    }

    pub fn open_state(&self) -> Result<State> {
        State::open(self.dir.join(STATE_FILE))
    }

    pub fn record_error(&self, err: &SiftError) -> Result<()> {
        write_json_atomic(&self.dir.join(ERROR_FILE), &ProjectError::from(err))
    }

    pub fn read_error(&self) -> Result<Option<ProjectError>> {
        let path = self.dir.join(ERROR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    pub fn clear_error(&self) -> Result<()> {
        match fs::remove_file(self.dir.join(ERROR_FILE)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Write through a temp file and rename, so readers never see a partial file
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
