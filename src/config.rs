//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリ上の TOML ファイルを起動時に 1 回だけ読み込む。
//! 実行中の再設定は行わない。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::brain::scorer::Priority;
use crate::error::{LiveBrainError, LiveBrainResult};

/// 判定エンジンのチューニング値（これ以外のキーは受け付けない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrainConfig {
    /// 発話間隔の下限（秒）
    pub min_speak_interval: f64,
    /// 発話間隔の上限（秒）。無発話がこれを超えたらキューから埋める
    pub max_speak_interval: f64,
    /// 外部発話時のクールダウン（秒）
    pub default_cooldown: f64,
    /// この優先度以下は SKIP
    pub skip_threshold: u8,
    /// この優先度以上はクールダウン明けなら SPEAK
    pub high_priority_threshold: u8,
    /// この優先度以上はクールダウンを無視して SPEAK
    pub auto_speak_priority: u8,
    /// キュー容量
    pub max_queue_size: usize,
    /// キュー最大滞留時間（秒）
    pub queue_timeout: f64,
    pub enable_state_machine: bool,
    pub auto_state_transition: bool,
    /// 無遷移で減衰するまでの秒数
    pub idle_timeout: f64,
    /// メトリクス出力間隔（秒）
    pub metrics_export_interval: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            min_speak_interval: 3.0,
            max_speak_interval: 15.0,
            default_cooldown: 4.0,
            skip_threshold: 3,
            high_priority_threshold: 7,
            auto_speak_priority: 9,
            max_queue_size: 10,
            queue_timeout: 30.0,
            enable_state_machine: true,
            auto_state_transition: true,
            idle_timeout: 60.0,
            metrics_export_interval: 300,
        }
    }
}

impl BrainConfig {
    /// 値の整合性を検証
    pub fn validate(&self) -> LiveBrainResult<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(LiveBrainError::config(format!("{} must be positive, got {}", name, value)))
            }
        };
        positive("min_speak_interval", self.min_speak_interval)?;
        positive("max_speak_interval", self.max_speak_interval)?;
        positive("default_cooldown", self.default_cooldown)?;
        positive("queue_timeout", self.queue_timeout)?;
        positive("idle_timeout", self.idle_timeout)?;

        if self.min_speak_interval > self.max_speak_interval {
            return Err(LiveBrainError::config(format!(
                "min_speak_interval ({}) exceeds max_speak_interval ({})",
                self.min_speak_interval, self.max_speak_interval
            )));
        }

        let (skip, high, auto) = (
            self.skip_threshold,
            self.high_priority_threshold,
            self.auto_speak_priority,
        );
        if !(1 <= skip && skip < high && high <= auto && auto <= 10) {
            return Err(LiveBrainError::config(format!(
                "thresholds must satisfy 1 <= skip ({}) < high ({}) <= auto ({}) <= 10",
                skip, high, auto
            )));
        }

        if self.max_queue_size == 0 {
            return Err(LiveBrainError::config("max_queue_size must be at least 1"));
        }
        if self.metrics_export_interval == 0 {
            return Err(LiveBrainError::config("metrics_export_interval must be at least 1"));
        }
        Ok(())
    }

    pub fn skip_priority(&self) -> Priority {
        Priority::new(i64::from(self.skip_threshold))
    }

    pub fn high_priority(&self) -> Priority {
        Priority::new(i64::from(self.high_priority_threshold))
    }

    pub fn auto_priority(&self) -> Priority {
        Priority::new(i64::from(self.auto_speak_priority))
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// 保存するログファイル数上限
    pub max_log_files: u32,
    /// ログファイル名の接頭辞
    pub log_file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            max_log_files: 30,
            log_file_prefix: "livebrain".to_string(),
        }
    }
}

/// 下流転送のリトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 2_000,
        }
    }
}

/// サービス層の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// キュー消化・減衰判定の周期（ミリ秒）
    pub tick_interval_ms: u64,
    /// メトリクス出力先（None ならファイル出力しない）
    pub metrics_dir: Option<PathBuf>,
    /// 入力チャネルのバッファ数
    pub intake_buffer: usize,
    /// メトリクスチャネルのバッファ数
    pub metrics_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            metrics_dir: None,
            intake_buffer: 1024,
            metrics_buffer: 4096,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub brain: BrainConfig,
    pub log: LogConfig,
    pub forward: ForwardConfig,
    pub service: ServiceConfig,
}

/// 設定・データディレクトリの識別子（qualifier, organization, application）
const PROJECT_ID: (&str, &str, &str) = ("io", "livebrain", "livebrain");

fn project_dirs() -> Option<ProjectDirs> {
    let (qualifier, organization, application) = PROJECT_ID;
    ProjectDirs::from(qualifier, organization, application)
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG の既定パスを使う設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 任意パスの設定ファイルを使う
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    fn get_config_path() -> Result<PathBuf> {
        let project_dirs = project_dirs().context("Failed to get project directories")?;

        let config_file = project_dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());

        Ok(config_file)
    }

    /// 既定のデータディレクトリ（ログ出力先）
    pub fn default_data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// 設定を読み込み、検証する
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config = parse_config(&config_content).with_context(|| {
            format!("Failed to parse config file: {}", self.config_path.display())
        })?;

        info!("✅ Configuration loaded from: {}", self.config_path.display());

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!("Failed to write config file: {}", self.config_path.display())
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());

        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config_exists(&self) -> bool {
        self.config_path.exists()
    }
}

/// TOML 文字列から設定を読み込み、検証する
pub fn parse_config(content: &str) -> LiveBrainResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.brain.validate()?;
    Ok(config)
}
