//! ログ出力の初期化。

pub mod tracing;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// ログの出力形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}
