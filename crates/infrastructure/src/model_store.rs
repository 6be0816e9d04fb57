use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use domain::model::DeviceModel;

/// File-per-model persistence. Each registered model lives at
/// `<dir>/<id>.json`; writes go to a temp file first and are renamed into
/// place so readers never observe a torn file.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Scans the model directory at startup. Files that fail to parse are
    /// skipped with a warning rather than aborting the engine.
    pub async fn scan(&self) -> Result<Vec<DeviceModel>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create model dir {}", self.dir.display()))?;

        let mut models = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read model dir {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read model file");
                    continue;
                }
            };
            match serde_json::from_slice::<DeviceModel>(&bytes) {
                Ok(model) => {
                    if let Err(e) = model.validate() {
                        warn!(path = %path.display(), error = %e, "Skipping invalid model file");
                        continue;
                    }
                    models.push(model);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unparseable model file");
                }
            }
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = models.len(), dir = %self.dir.display(), "Model directory scanned");
        Ok(models)
    }

    /// Persists a model atomically (write-then-rename).
    pub async fn save(&self, model: &DeviceModel) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.model_path(&model.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", model.id));

        let json = serde_json::to_vec_pretty(model)?;
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("failed to move model into place at {}", target.display()))?;

        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let path = self.model_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
