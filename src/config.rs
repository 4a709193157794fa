use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::auth::ThrottlePolicy;
use crate::crypto::DEFAULT_PBKDF2_ITERATIONS;
use crate::recycle::RecyclePolicy;

pub const APP_DIR: &str = "workflow-tracker";
pub const DATA_DIR_ENV: &str = "WORKFLOW_DATA_DIR";
pub const ITERATIONS_ENV: &str = "WORKFLOW_PBKDF2_ITERATIONS";

/// What `load` does when the live database cannot be read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// Log a warning and continue with an empty database.
    #[default]
    ResetToDefault,
    /// Return the underlying error to the caller.
    Surface,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub pbkdf2_iterations: u32,
    pub recycle: RecyclePolicy,
    pub login: ThrottlePolicy,
    pub load_failure: LoadFailurePolicy,
    /// Write through a temp file and rename instead of overwriting in place.
    pub atomic_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            recycle: RecyclePolicy::default(),
            login: ThrottlePolicy::default(),
            load_failure: LoadFailurePolicy::default(),
            atomic_writes: true,
        }
    }
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `WORKFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ITERATIONS_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(iterations) if iterations > 0 => self.pbkdf2_iterations = iterations,
                _ => tracing::warn!(var = ITERATIONS_ENV, "ignoring invalid iteration count"),
            }
        }
        self
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Reads a whole number of seconds into a [`Duration`].
pub(crate) fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}
