//! 実行オプション。
//!
//! JSON 設定ファイルを読み込み、CLI のドット区切り上書きをマージしてから
//! [`Options`] にデシリアライズする。読み込み後のオプションは不変で、
//! パイプライン全体に参照で渡される。

pub mod cli;
pub mod overrides;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::adjacency::AdjacencyTransform;
use crate::batch::MaxSizeMethod;
use crate::cache::CachePolicy;
use crate::graph::SplitKind;

pub use overrides::{Override, merge_overrides, parse_override, split_override_args};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid option tree: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("missing required option: {0}")]
    Missing(String),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConfigError {
    fn invalid(name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Invalid {
            name: name.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
}

impl Precision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Ipu,
}

impl Device {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Ipu => "ipu",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_seed() -> u64 {
    1984
}

fn default_imbalance_tolerance() -> f32 {
    0.05
}

/// `model` section. Keys other than `adjacency` are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default)]
    pub adjacency: AdjacencyTransform,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `training` / `validation` / `test` sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOptions {
    #[serde(default)]
    pub num_clusters: Option<usize>,
    #[serde(default)]
    pub max_nodes_per_batch: Option<usize>,
    #[serde(default = "default_one")]
    pub clusters_per_batch: usize,
    /// Overrides `model.adjacency` for this split.
    #[serde(default)]
    pub adjacency: Option<AdjacencyTransform>,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_true")]
    pub use_sparse_representation: bool,
    #[serde(default = "default_one")]
    pub epochs: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SplitOptions {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        match (self.num_clusters, self.max_nodes_per_batch) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::invalid(
                    section,
                    anyhow!("num_clusters and max_nodes_per_batch are mutually exclusive"),
                ));
            }
            (None, None) => {
                return Err(ConfigError::Missing(format!(
                    "{section}.num_clusters or {section}.max_nodes_per_batch"
                )));
            }
            _ => {}
        }
        if self.clusters_per_batch == 0 {
            return Err(ConfigError::invalid(
                format!("{section}.clusters_per_batch"),
                anyhow!("must be greater than zero"),
            ));
        }
        if let Some(num_clusters) = self.num_clusters {
            if num_clusters == 0 {
                return Err(ConfigError::invalid(
                    format!("{section}.num_clusters"),
                    anyhow!("must be greater than zero"),
                ));
            }
            if self.clusters_per_batch > num_clusters {
                return Err(ConfigError::invalid(
                    format!("{section}.clusters_per_batch"),
                    anyhow!(
                        "{} exceeds num_clusters ({num_clusters})",
                        self.clusters_per_batch
                    ),
                ));
            }
        }
        if self.max_nodes_per_batch == Some(0) {
            return Err(ConfigError::invalid(
                format!("{section}.max_nodes_per_batch"),
                anyhow!("must be greater than zero"),
            ));
        }
        Ok(())
    }

    /// Cluster count for a split with `visible` nodes.
    ///
    /// With `max_nodes_per_batch` the count is
    /// `ceil(visible * clusters_per_batch / max_nodes_per_batch)`, never below
    /// `clusters_per_batch`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the count exceeds `visible`.
    pub fn resolve_num_clusters(&self, section: &str, visible: usize) -> Result<usize, ConfigError> {
        let num_clusters = match (self.num_clusters, self.max_nodes_per_batch) {
            (Some(num_clusters), _) => num_clusters,
            (None, Some(max_nodes)) => (visible * self.clusters_per_batch)
                .div_ceil(max_nodes)
                .max(self.clusters_per_batch),
            (None, None) => {
                return Err(ConfigError::Missing(format!(
                    "{section}.num_clusters or {section}.max_nodes_per_batch"
                )));
            }
        };
        if num_clusters > visible {
            return Err(ConfigError::invalid(
                format!("{section}.num_clusters"),
                anyhow!("{num_clusters} clusters requested for {visible} nodes"),
            ));
        }
        Ok(num_clusters)
    }
}

/// Cache switches from the command line; `None` keeps the config file's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFlags {
    pub regenerate_dataset_cache: Option<bool>,
    pub save_dataset_cache: Option<bool>,
    pub regenerate_clustering_cache: Option<bool>,
    pub save_clustering_cache: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub name: String,
    pub dataset_name: String,
    pub data_path: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub regenerate_dataset_cache: bool,
    #[serde(default = "default_true")]
    pub save_dataset_cache: bool,
    #[serde(default)]
    pub regenerate_clustering_cache: bool,
    #[serde(default = "default_true")]
    pub save_clustering_cache: bool,
    #[serde(default)]
    pub method_max_nodes: MaxSizeMethod,
    #[serde(default)]
    pub method_max_edges: MaxSizeMethod,
    #[serde(default = "default_imbalance_tolerance")]
    pub imbalance_tolerance: f32,
    #[serde(default)]
    pub model: ModelOptions,
    pub training: SplitOptions,
    #[serde(default)]
    pub validation: Option<SplitOptions>,
    #[serde(default)]
    pub test: Option<SplitOptions>,
    /// Keys this crate does not interpret (wandb, lr, pipeline mapping, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Options {
    /// # Errors
    /// See [`Options::load`].
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::load(path, &[])
    }

    /// Reads a JSON config, applies `overrides` to the raw tree, then deserializes and validates.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read or parsed, an
    /// override does not fit the tree, or validation fails.
    pub fn load(path: &Path, overrides: &[Override]) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tree: Value =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        merge_overrides(&mut tree, overrides)?;
        Self::from_value(tree)
    }

    /// # Errors
    /// Returns [`ConfigError`] when the tree does not deserialize or validate.
    pub fn from_value(tree: Value) -> Result<Self, ConfigError> {
        for required in ["name", "dataset_name", "data_path", "training"] {
            if tree.get(required).is_none() {
                return Err(ConfigError::Missing(required.to_string()));
            }
        }
        let options: Self = serde_json::from_value(tree).map_err(ConfigError::Deserialize)?;
        options.validate()?;
        Ok(options)
    }

    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("name".to_string()));
        }
        if self.dataset_name.trim().is_empty() {
            return Err(ConfigError::Missing("dataset_name".to_string()));
        }
        if !(0.0..1.0).contains(&self.imbalance_tolerance) {
            return Err(ConfigError::invalid(
                "imbalance_tolerance",
                anyhow!("{} is outside [0, 1)", self.imbalance_tolerance),
            ));
        }
        for kind in SplitKind::ALL {
            if let Some(split) = self.split(kind) {
                split.validate(kind.as_str())?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn split(&self, kind: SplitKind) -> Option<&SplitOptions> {
        match kind {
            SplitKind::Training => Some(&self.training),
            SplitKind::Validation => self.validation.as_ref(),
            SplitKind::Test => self.test.as_ref(),
        }
    }

    /// Transform for `kind`: the split's own `adjacency`, else `model.adjacency`.
    #[must_use]
    pub fn transform_for(&self, kind: SplitKind) -> AdjacencyTransform {
        self.split(kind)
            .and_then(|split| split.adjacency)
            .unwrap_or(self.model.adjacency)
    }

    #[must_use]
    pub fn with_cache_flags(mut self, flags: CacheFlags) -> Self {
        if let Some(value) = flags.regenerate_dataset_cache {
            self.regenerate_dataset_cache = value;
        }
        if let Some(value) = flags.save_dataset_cache {
            self.save_dataset_cache = value;
        }
        if let Some(value) = flags.regenerate_clustering_cache {
            self.regenerate_clustering_cache = value;
        }
        if let Some(value) = flags.save_clustering_cache {
            self.save_clustering_cache = value;
        }
        self
    }

    #[must_use]
    pub fn dataset_policy(&self) -> CachePolicy {
        CachePolicy::new(self.regenerate_dataset_cache, self.save_dataset_cache)
    }

    #[must_use]
    pub fn clustering_policy(&self) -> CachePolicy {
        CachePolicy::new(self.regenerate_clustering_cache, self.save_clustering_cache)
    }

    /// Processed datasets and clusterings are cached next to the raw data.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.data_path.join("cache")
    }
}
