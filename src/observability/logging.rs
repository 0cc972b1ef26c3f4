//! ログ初期化
//!
//! stderr への compact 出力に加え、設定があれば日次ローテーションのファイル出力を行う。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigManager, LogConfig};

/// ログ出力先ディレクトリを解決
pub fn resolve_log_dir(config: &LogConfig) -> Option<PathBuf> {
    config
        .log_dir
        .clone()
        .or_else(|| ConfigManager::default_data_dir().map(|dir| dir.join("logs")))
}

/// ログを初期化する
///
/// 返り値の `WorkerGuard` はファイル出力のフラッシュに必要なので、
/// プロセス終了まで保持すること。
pub fn init_logging(config: &LogConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    #[cfg(feature = "debug-tokio")]
    {
        console_subscriber::init();
        tracing::info!("🔍 tokio-console subscriber initialized");
        let _ = (config, debug);
        return Ok(None);
    }

    #[cfg(not(feature = "debug-tokio"))]
    {
        let level = if debug { "debug" } else { config.log_level.as_str() };
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .context("Failed to build log filter")?;

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact();

        let (file_layer, guard) = match (config.enable_file_logging, resolve_log_dir(config)) {
            (true, Some(dir)) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
                cleanup_old_logs(&dir, &config.log_file_prefix, config.max_log_files as usize);

                let appender = tracing_appender::rolling::daily(&dir, format!("{}.log", config.log_file_prefix));
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
                (Some(layer), Some(guard))
            }
            _ => (None, None),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        Ok(guard)
    }
}

/// 上限を超えた古いログファイルを削除し、削除数を返す
pub fn cleanup_old_logs(dir: &Path, prefix: &str, max_files: usize) -> usize {
    let pattern = dir.join(format!("{}.log*", prefix));
    let Some(pattern) = pattern.to_str() else {
        return 0;
    };

    let mut files: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ Invalid log file pattern");
            return 0;
        }
    };

    if files.len() <= max_files {
        return 0;
    }

    // 日付サフィックス付きのファイル名は辞書順 = 時系列順
    files.sort();
    let excess = files.len() - max_files;
    let mut removed = 0;
    for path in files.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "⚠️ Failed to remove old log file"),
        }
    }
    if removed > 0 {
        tracing::info!(removed, "🧹 Old log files cleaned up");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04"] {
            std::fs::write(dir.path().join(format!("livebrain.log.{}", day)), "x").unwrap();
        }
        std::fs::write(dir.path().join("other.log"), "x").unwrap();

        let removed = cleanup_old_logs(dir.path(), "livebrain", 2);
        assert_eq!(removed, 2);
        assert!(!dir.path().join("livebrain.log.2024-01-01").exists());
        assert!(dir.path().join("livebrain.log.2024-01-04").exists());
        assert!(dir.path().join("other.log").exists());
    }

    #[test]
    fn test_cleanup_under_limit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("livebrain.log.2024-01-01"), "x").unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), "livebrain", 5), 0);
    }

    #[test]
    fn test_explicit_log_dir_wins() {
        let config = LogConfig {
            log_dir: Some(PathBuf::from("/tmp/livebrain-logs")),
            ..LogConfig::default()
        };
        assert_eq!(resolve_log_dir(&config), Some(PathBuf::from("/tmp/livebrain-logs")));
    }
}
