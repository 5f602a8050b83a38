use anyhow::{Error, Result};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use super::LogFormat;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// `RUST_LOG` が未設定の場合は `info` レベルで出力する。2 回目以降の呼び出しは何もしない。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init(format: LogFormat) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        let result = match format {
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().with_target(false).json())
                .try_init(),
            LogFormat::Pretty => registry
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init(),
        };
        result.map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;

        info!(format = ?format, "tracing initialized");
        Ok::<(), Error>(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        assert!(init(LogFormat::Json).is_ok());
        assert!(init(LogFormat::Pretty).is_ok());
    }
}
