use std::path::PathBuf;

use clap::Parser;

use super::overrides::{Override, parse_override, split_override_args};
use super::{CacheFlags, ConfigError};
use crate::observability::LogFormat;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file
    #[arg(long, short, env = "CLUSTER_BATCHER_CONFIG")]
    pub config: PathBuf,

    /// Ignore the processed dataset cache and rebuild it
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub regenerate_dataset_cache: Option<bool>,

    /// Persist the processed dataset
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub save_dataset_cache: Option<bool>,

    /// Ignore cached clusterings and recluster
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub regenerate_clustering_cache: Option<bool>,

    /// Persist computed clusterings
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub save_clustering_cache: Option<bool>,

    /// Extra KEY=VALUE overrides; keys are dotted paths into the config
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Epochs of batches to stream per split (defaults to each split's `epochs`)
    #[arg(long)]
    pub stream_epochs: Option<usize>,

    /// Cluster the splits without assembling any batch
    #[arg(long)]
    pub prepare_only: bool,

    /// Index of this worker when batches are sharded
    #[arg(long, env = "WORKER_INDEX", default_value = "0")]
    pub worker_index: usize,

    /// Number of workers sharing each epoch
    #[arg(long, env = "WORKER_COUNT", default_value = "1")]
    pub worker_count: usize,

    /// Worker threads for clustering (defaults to the number of CPUs)
    #[arg(long, env = "CLUSTER_BATCHER_THREADS")]
    pub threads: Option<usize>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Parses `args`, separating dotted `--a.b value` overrides from regular flags.
    ///
    /// Overrides from `--set` come after the dotted flags, so they win on conflicts.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for malformed overrides; clap errors exit the process as usual.
    pub fn parse_with_overrides<I>(args: I) -> Result<(Self, Vec<Override>), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let (passthrough, mut overrides) = split_override_args(args)?;
        let cli = Self::parse_from(passthrough);
        for raw in &cli.overrides {
            overrides.push(parse_override(raw)?);
        }
        Ok((cli, overrides))
    }

    #[must_use]
    pub fn cache_flags(&self) -> CacheFlags {
        CacheFlags {
            regenerate_dataset_cache: self.regenerate_dataset_cache,
            save_dataset_cache: self.save_dataset_cache,
            regenerate_clustering_cache: self.regenerate_clustering_cache,
            save_clustering_cache: self.save_clustering_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| (*arg).to_string()).collect()
    }

    #[test]
    fn cache_flags_accept_bare_and_explicit_values() {
        let (cli, _) = Cli::parse_with_overrides(args(&[
            "cluster-batcher",
            "--config",
            "train.json",
            "--regenerate-clustering-cache",
            "--save-dataset-cache=false",
        ]))
        .expect("arguments parse");
        let flags = cli.cache_flags();
        assert_eq!(flags.regenerate_clustering_cache, Some(true));
        assert_eq!(flags.save_dataset_cache, Some(false));
        assert_eq!(flags.regenerate_dataset_cache, None);
    }

    #[test]
    fn dotted_flags_and_set_are_collected_in_order() {
        let (cli, overrides) = Cli::parse_with_overrides(args(&[
            "cluster-batcher",
            "--config",
            "train.json",
            "--training.epochs",
            "3",
            "--set",
            "seed=7",
        ]))
        .expect("arguments parse");
        assert_eq!(cli.config, PathBuf::from("train.json"));
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0].path, "training.epochs");
        assert_eq!(overrides[1].value, json!(7));
        assert_eq!(cli.worker_count, 1);
    }
}
