//! Calculation record storage API.

use std::fs;
use std::path::PathBuf;

use qf_core::Calculation;

use crate::{StoreError, StoreResult};

/// One pretty-printed JSON record per calculation under `root_dir`.
#[derive(Debug, Clone)]
pub struct CalculationStore {
    root_dir: PathBuf,
}

impl CalculationStore {
    pub fn new(root_dir: PathBuf) -> StoreResult<Self> {
        if !root_dir.exists() {
            fs::create_dir_all(&root_dir)?;
        }
        Ok(Self { root_dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root_dir.join(format!("{name}.json"))
    }

    pub fn has_record(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Write through a temporary file so a crash never leaves a torn record.
    pub fn save(&self, calc: &Calculation) -> StoreResult<()> {
        let path = self.record_path(calc.name.as_str());
        let tmp = self.root_dir.join(format!(".{}.json.tmp", calc.name));
        let content = serde_json::to_string_pretty(calc)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> StoreResult<Calculation> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(StoreError::RecordNotFound {
                name: name.to_string(),
            });
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All readable records, sorted by name. Unreadable records are skipped.
    pub fn list(&self) -> StoreResult<Vec<Calculation>> {
        let mut calcs = Vec::new();
        if !self.root_dir.exists() {
            return Ok(calcs);
        }

        for entry in fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.load(name) {
                Ok(calc) => calcs.push(calc),
                Err(err) => tracing::warn!(record = %path.display(), "skipping unreadable record: {err}"),
            }
        }

        calcs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(calcs)
    }

    pub fn delete(&self, name: &str) -> StoreResult<()> {
        let path = self.record_path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
