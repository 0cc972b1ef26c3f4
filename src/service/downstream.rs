//! 下流（応答生成側）への出力口

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};

use crate::error::{LiveBrainError, LiveBrainResult};
use crate::io::{write_ndjson_line, DecisionEnvelope};

/// 下流バックエンドトレイト
#[async_trait]
pub trait Downstream: Send + Sync {
    /// 判定を 1 件送る
    async fn forward(&self, envelope: &DecisionEnvelope) -> LiveBrainResult<()>;

    /// バックエンド名を取得
    fn name(&self) -> &'static str;
}

/// 任意の非同期ライター（stdout など）へ NDJSON で書き出す
pub struct NdjsonDownstream<W> {
    writer: Mutex<W>,
}

impl<W> NdjsonDownstream<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Downstream for NdjsonDownstream<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn forward(&self, envelope: &DecisionEnvelope) -> LiveBrainResult<()> {
        let mut writer = self.writer.lock().await;
        write_ndjson_line(&mut *writer, envelope).await
    }

    fn name(&self) -> &'static str {
        "ndjson"
    }
}

/// tokio mpsc チャネルへ送る（同一プロセス内の応答生成器・テスト用）
pub struct ChannelDownstream {
    sender: mpsc::Sender<DecisionEnvelope>,
}

impl ChannelDownstream {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DecisionEnvelope>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Downstream for ChannelDownstream {
    async fn forward(&self, envelope: &DecisionEnvelope) -> LiveBrainResult<()> {
        self.sender
            .send(envelope.clone())
            .await
            .map_err(|_| LiveBrainError::downstream("response generator channel closed"))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{CommentEvent, Intent, LiveBrain};
    use crate::config::BrainConfig;
    use chrono::Utc;

    fn envelope() -> DecisionEnvelope {
        let now = Utc::now();
        let mut brain = LiveBrain::new(BrainConfig::default(), now);
        let decision = brain.decide(CommentEvent::new("u1", "hello shop", Intent::Greeting, now), now);
        DecisionEnvelope::from(&decision)
    }

    #[tokio::test]
    async fn test_ndjson_downstream_writes_lines() {
        let downstream = NdjsonDownstream::new(Vec::new());
        downstream.forward(&envelope()).await.unwrap();
        downstream.forward(&envelope()).await.unwrap();

        let written = String::from_utf8(downstream.into_inner()).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DecisionEnvelope = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.input.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_channel_downstream_reports_closed_receiver() {
        let (downstream, receiver) = ChannelDownstream::new(4);
        drop(receiver);
        let err = downstream.forward(&envelope()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(downstream.name(), "channel");
    }
}
