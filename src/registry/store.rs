//! Persisted routes, one TOML file per model under the storage root.
//!
//! A model named `meta-llama/Llama-3.1-8B` is stored at
//! `<root>/meta-llama/Llama-3.1-8B.toml`. Routes are replaced atomically and
//! never edited in place.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::Error;
use crate::config::CONFIG_FILE_NAME;
use crate::utils::paths::{secure_path, validate_model_name};
use crate::utils::tempfile::write_atomic;

const ROUTE_EXTENSION: &str = ".toml";

/// One file of a weights download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct WeightsFile {
    pub file: String,
    pub size_bytes: u64,
}

/// Weights downloaded for a locally served model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct LocalWeights {
    pub repo_id: String,
    pub path: PathBuf,
    /// Combined size of every file
    pub size_bytes: u64,
    pub files: Vec<WeightsFile>,
}

/// Where requests for a model go. Values left out are filled in from the
/// named provider when the route is resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct ModelRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub body: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<LocalWeights>,
}

pub(crate) struct RouteStore {
    root: PathBuf,
    models_dir: PathBuf,
}

impl RouteStore {
    pub(crate) fn new(root: &Path, models_dir: &Path) -> RouteStore {
        RouteStore {
            root: root.to_path_buf(),
            models_dir: models_dir.to_path_buf(),
        }
    }

    /// The file a model's route lives in.
    pub(crate) fn route_path(&self, model: &str) -> Result<PathBuf, Error> {
        validate_model_name(model).map_err(|_| Error::SecurityRejection)?;

        if format!("{}{}", model, ROUTE_EXTENSION) == CONFIG_FILE_NAME {
            return Err(Error::Validation(format!(
                "\"{}\" is a reserved name",
                model
            )));
        }

        let path = secure_path(&self.root, &format!("{}{}", model, ROUTE_EXTENSION))
            .ok_or(Error::SecurityRejection)?;

        if path.starts_with(&self.models_dir) {
            return Err(Error::Validation(format!(
                "\"{}\" collides with the models directory",
                model
            )));
        }

        Ok(path)
    }

    pub(crate) async fn load(&self, model: &str) -> Result<Option<ModelRoute>, Error> {
        let path = self.route_path(model)?;

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Persistence(err.to_string())),
        };

        let route: ModelRoute = toml::from_str(&raw).map_err(|err| Error::InvalidPersistedState {
            model: model.to_string(),
            reason: err.message().to_string(),
        })?;

        Ok(Some(route))
    }

    pub(crate) async fn save(&self, model: &str, route: &ModelRoute) -> Result<(), Error> {
        let path = self.route_path(model)?;

        let contents =
            toml::to_string(route).map_err(|err| Error::Persistence(err.to_string()))?;

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            write_atomic(&path, contents.as_bytes())
        })
        .await
        .map_err(|err| Error::Persistence(err.to_string()))?
        .map_err(|err| Error::Persistence(err.to_string()))
    }

    /// Deletes a route. Returns false if there was none.
    pub(crate) async fn remove(&self, model: &str) -> Result<bool, Error> {
        let path = self.route_path(model)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Persistence(err.to_string())),
        }
    }

    /// Every model with a persisted route, sorted.
    pub(crate) async fn list(&self) -> Result<Vec<String>, Error> {
        let root = self.root.clone();
        let models_dir = self.models_dir.clone();

        tokio::task::spawn_blocking(move || list_routes(&root, &models_dir))
            .await
            .map_err(|err| Error::Persistence(err.to_string()))?
    }
}

fn list_routes(root: &Path, models_dir: &Path) -> Result<Vec<String>, Error> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let config_path = root.join(CONFIG_FILE_NAME);

    let mut models = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.path() != models_dir);

    for entry in walker {
        let entry = entry.map_err(|err| Error::Persistence(err.to_string()))?;

        if !entry.file_type().is_file() || entry.path() == config_path {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };

        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        let name = parts.join("/");

        if let Some(model) = name.strip_suffix(ROUTE_EXTENSION) {
            if validate_model_name(model).is_ok() {
                models.push(model.to_string());
            }
        }
    }

    models.sort();

    Ok(models)
}
