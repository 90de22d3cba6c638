//! JSON-file backed environment store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use postrun_error::StoreError;
use postrun_sandbox::{EnvironmentSnapshot, EnvironmentStore};

/// Stores one environment as a JSON file shaped like [`EnvironmentSnapshot`].
pub struct FileEnvironmentStore {
    path: PathBuf,
}

impl FileEnvironmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the environment file.
    pub fn load(&self) -> Result<EnvironmentSnapshot, StoreError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("invalid environment file {}", self.path.display()))?;
        Ok(snapshot)
    }

    fn write_atomic(&self, snapshot: &EnvironmentSnapshot) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EnvironmentStore for FileEnvironmentStore {
    async fn save_variables(
        &self,
        environment_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut snapshot = self.load()?;
        if snapshot.id != environment_id {
            return Err(StoreError::EnvironmentNotFound(environment_id.to_string()));
        }
        snapshot.variables = variables.clone();
        self.write_atomic(&snapshot)?;
        Ok(())
    }
}
