//! # ModelRegistry — static model → launch-recipe registry
//!
//! ## Responsibility
//! Load and validate the TOML registry consumed by the autostart broker:
//! which models exist, and how to launch a worker process for each.
//!
//! ## File format
//!
//! ```toml
//! [models.lj]
//! command = ["mlip-worker", "lj"]
//!
//! [models.mace-mpa-0]
//! command = ["uv", "run", "--extra", "mace", "mlip-worker", "mace-mpa-0"]
//! extras = ["mace"]
//! ```
//!
//! The `command` is the complete launch argv and stays opaque to the
//! broker, which only appends `--timeout <secs>` and `--backend <addr>`
//! when spawning. `extras` are dependency tags surfaced in status
//! replies; they are not interpreted.
//!
//! ## Guarantees
//! - Model names never collide with reserved protocol tags
//! - Every recipe has a non-empty launch command
//! - Deterministic name ordering (sorted)

use crate::protocol::RESERVED_TAGS;
use crate::ServeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Launch recipe for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecipe {
    /// Complete launch argv (program followed by its arguments).
    pub command: Vec<String>,

    /// Dependency tags for this model (informational).
    #[serde(default)]
    pub extras: Vec<String>,
}

/// The static model registry loaded once at autostart-broker startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    #[serde(default)]
    models: BTreeMap<String, ModelRecipe>,
}

impl ModelRegistry {
    /// Load and validate a registry from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ServeError::Registry`] when the file is missing, unparsable, or
    /// contains an invalid entry.
    pub fn load(path: &Path) -> Result<Self, ServeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServeError::Registry(format!("cannot read {}: {e}", path.display()))
        })?;
        let registry: Self = toml::from_str(&text).map_err(|e| {
            ServeError::Registry(format!("cannot parse {}: {e}", path.display()))
        })?;
        registry.validate()?;
        Ok(registry)
    }

    /// Build a registry from in-memory recipes (used by tests and
    /// embedding programs).
    ///
    /// # Errors
    ///
    /// [`ServeError::Registry`] when an entry is invalid.
    pub fn from_recipes(
        recipes: impl IntoIterator<Item = (String, ModelRecipe)>,
    ) -> Result<Self, ServeError> {
        let registry = Self {
            models: recipes.into_iter().collect(),
        };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), ServeError> {
        for (name, recipe) in &self.models {
            if name.is_empty() {
                return Err(ServeError::Registry("empty model name".to_string()));
            }
            if RESERVED_TAGS.iter().any(|tag| *tag == name.as_bytes()) {
                return Err(ServeError::Registry(format!(
                    "model name '{name}' collides with a reserved protocol tag"
                )));
            }
            if recipe.command.is_empty() {
                return Err(ServeError::Registry(format!(
                    "model '{name}' has an empty launch command"
                )));
            }
        }
        Ok(())
    }

    /// Recipe for `name`, if registered.
    pub fn get(&self, name: &str) -> Option<&ModelRecipe> {
        self.models.get(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered model names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry has no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
