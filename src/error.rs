//! クレート共通のエラー型
//!
//! SKIP / QUEUE_FULL / DUPLICATE といった想定内の結果はエラーではなく
//! `Decision` として表現する。ここに並ぶのは境界層（入力パース、設定読み込み、
//! 下流への転送、バイナリ）で発生する失敗のみ。

use thiserror::Error;

/// livebrain のエラー型
#[derive(Error, Debug)]
pub enum LiveBrainError {
    /// 必須フィールド欠落・不正値
    #[error("Malformed input: field '{field}' {reason}")]
    MalformedInput { field: String, reason: String },

    /// キュー満杯（Decision 上は通常の SKIP として扱われる）
    #[error("Pending queue is full")]
    QueueFull,

    /// 遷移表に定義のない組み合わせ（全域表のため本来発生しない）
    #[error("Undefined state transition from {phase} on {trigger}")]
    StateTransitionUndefined { phase: String, trigger: String },

    /// 下流（応答生成側）に到達できない
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// 設定値の不整合
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O エラー
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON パースエラー
    #[error("JSON parsing error at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// TOML パースエラー
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// シャットダウン中のため受け付けない
    #[error("Engine is shutting down")]
    Shutdown,
}

impl LiveBrainError {
    /// 入力不正エラーを作成
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 下流到達不可エラーを作成
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::DownstreamUnavailable(message.into())
    }

    /// 設定エラーを作成
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// 転送リトライの対象になるか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DownstreamUnavailable(_) | Self::Io(_))
    }
}

/// livebrain の Result 型
pub type LiveBrainResult<T> = Result<T, LiveBrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message() {
        let err = LiveBrainError::malformed("user_id", "is missing");
        assert_eq!(
            err.to_string(),
            "Malformed input: field 'user_id' is missing"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(LiveBrainError::downstream("no clients").is_retryable());
        assert!(!LiveBrainError::QueueFull.is_retryable());
        assert!(!LiveBrainError::config("bad").is_retryable());
    }
}
