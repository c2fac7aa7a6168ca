//! Declared Model Sources
//!
//! The application's model-definition layer exports its current models as a
//! JSON manifest; this module loads and validates it into a `ModelSet`.

use crate::error::{GateError, GateResult};
use crate::schema::{ModelKey, ModelSet, ModelState};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// A source of the declared model set
pub trait ModelSource {
    fn describe(&self) -> String;

    fn load(&self) -> GateResult<ModelSet>;
}

/// Manifest document exported by the application
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub models: Vec<ModelState>,
    /// Models owned elsewhere (e.g., "auth.user") that relations may target
    #[serde(default)]
    pub external: Vec<ModelKey>,
}

impl Manifest {
    /// Validate every model and every relation target
    pub fn into_model_set(self) -> GateResult<ModelSet> {
        for model in &self.models {
            model.validate().map_err(GateError::InvalidModel)?;
        }

        let set = ModelSet::from_models(self.models).map_err(GateError::InvalidModel)?;
        let external: BTreeSet<ModelKey> = self.external.into_iter().collect();

        for (key, model) in set.iter() {
            for field in &model.fields {
                if let Some(relation) = &field.relation {
                    if !set.contains(&relation.to) && !external.contains(&relation.to) {
                        return Err(GateError::InvalidModel(format!(
                            "{}.{} references unknown model {}",
                            key, field.name, relation.to
                        )));
                    }
                }
            }
        }

        Ok(set)
    }
}

/// JSON manifest on disk
pub struct ManifestModelSource {
    path: PathBuf,
}

impl ManifestModelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModelSource for ManifestModelSource {
    fn describe(&self) -> String {
        format!("manifest {}", self.path.display())
    }

    fn load(&self) -> GateResult<ModelSet> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| GateError::io(&self.path, e))?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| GateError::parse(&self.path, e))?;
        let set = manifest.into_model_set()?;
        if set.is_empty() {
            warn!("{} declares no models", self.describe());
        }

        info!("Loaded {} declared models from {}", set.len(), self.describe());
        Ok(set)
    }
}

/// Models built in code, for tests
#[cfg(test)]
pub struct StaticModelSource(pub Vec<ModelState>);

#[cfg(test)]
impl ModelSource for StaticModelSource {
    fn describe(&self) -> String {
        "static models".to_string()
    }

    fn load(&self) -> GateResult<ModelSet> {
        Manifest {
            models: self.0.clone(),
            external: vec![ModelKey::new("auth", "user")],
        }
        .into_model_set()
    }
}
