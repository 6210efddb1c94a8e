//! LoRA adapter registry.
//!
//! Scans a directory for `*.safetensors` files and exposes them as
//! named style adapters for image generation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_STRENGTH: f64 = 0.8;

/// One discovered adapter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraModel {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub strength: f64,
    pub file_size: u64,
    pub enabled: bool,
}

/// Registry over a directory of adapter files.
pub struct LoraRegistry {
    dir: PathBuf,
    models: RwLock<HashMap<String, LoraModel>>,
}

impl LoraRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Scan the directory. Returns how many adapters were found.
    pub fn load(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)?;
        let mut models = self.models.write().unwrap();
        models.clear();
        for item in std::fs::read_dir(&self.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            models.insert(
                stem.to_string(),
                LoraModel {
                    id: stem.to_string(),
                    name: stem.to_string(),
                    path: path.clone(),
                    strength: DEFAULT_STRENGTH,
                    file_size,
                    enabled: true,
                },
            );
        }
        Ok(models.len())
    }

    pub fn get(&self, id: &str) -> Result<LoraModel> {
        self.models
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("lora {id}")))
    }

    pub fn list(&self) -> Vec<LoraModel> {
        let mut models: Vec<_> = self.models.read().unwrap().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut models = self.models.write().unwrap();
        let model = models
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("lora {id}")))?;
        model.enabled = enabled;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filename the image workflow should reference, when enabled.
    pub fn workflow_name(&self, id: &str) -> Option<String> {
        let models = self.models.read().unwrap();
        let model = models.get(id)?;
        if !model.enabled {
            return None;
        }
        model
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_safetensors_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ink_wash.safetensors"), b"fake").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let registry = LoraRegistry::new(dir.path());
        assert_eq!(registry.load().unwrap(), 1);
        let model = registry.get("ink_wash").unwrap();
        assert_eq!(model.strength, DEFAULT_STRENGTH);
        assert_eq!(model.file_size, 4);
        assert_eq!(
            registry.workflow_name("ink_wash").as_deref(),
            Some("ink_wash.safetensors")
        );
    }

    #[test]
    fn disabled_adapters_are_not_offered_to_workflows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"x").unwrap();
        let registry = LoraRegistry::new(dir.path());
        registry.load().unwrap();
        registry.set_enabled("a", false).unwrap();
        assert!(registry.workflow_name("a").is_none());
        assert!(registry.get("missing").is_err());
    }
}
