//! リトライ付き転送
//!
//! 判定そのものは転送前に確定している。転送失敗は指数バックオフで
//! 上限回数まで再試行し、使い切ったら FORWARD_FAILED としてメトリクスに記録する。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::downstream::Downstream;
use crate::brain::decision::Decision;
use crate::config::ForwardConfig;
use crate::io::DecisionEnvelope;
use crate::observability::{MetricsEvent, MetricsSink};

/// 転送結果
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: String },
}

/// 転送ワーカーの集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub delivered: u64,
    pub failed: u64,
}

/// リトライ付きの転送器
pub struct Forwarder {
    downstream: Arc<dyn Downstream>,
    config: ForwardConfig,
}

impl Forwarder {
    pub fn new(downstream: Arc<dyn Downstream>, config: ForwardConfig) -> Self {
        Self { downstream, config }
    }

    /// 指数バックオフで転送を試みる
    pub async fn forward_with_retry(&self, envelope: &DecisionEnvelope) -> ForwardOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut delay_ms = self.config.initial_delay_ms;

        loop {
            attempts += 1;

            match self.downstream.forward(envelope).await {
                Ok(()) => {
                    debug!(downstream = self.downstream.name(), attempts, "📤 Decision forwarded");
                    return ForwardOutcome::Delivered { attempts };
                }
                Err(e) if !e.is_retryable() || attempts >= max_attempts => {
                    error!(
                        downstream = self.downstream.name(),
                        attempts,
                        error = %e,
                        "❌ Forwarding failed, dropping decision"
                    );
                    return ForwardOutcome::Failed {
                        attempts,
                        error: e.to_string(),
                    };
                }
                Err(e) => {
                    warn!(
                        downstream = self.downstream.name(),
                        attempts,
                        delay_ms,
                        error = %e,
                        "⚠️ Forwarding failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = ((delay_ms as f64 * self.config.backoff_multiplier) as u64)
                        .min(self.config.max_delay_ms);
                }
            }
        }
    }
}

/// 転送ワーカーを起動する。送信側がすべて閉じるとキューを消化して終了する。
pub fn spawn_forwarder(
    forwarder: Forwarder,
    mut receiver: mpsc::Receiver<Decision>,
    metrics: MetricsSink,
) -> JoinHandle<ForwardStats> {
    tokio::spawn(async move {
        info!(downstream = forwarder.downstream.name(), "📤 Forwarder started");
        let mut stats = ForwardStats::default();

        while let Some(decision) = receiver.recv().await {
            let envelope = DecisionEnvelope::from(&decision);
            match forwarder.forward_with_retry(&envelope).await {
                ForwardOutcome::Delivered { attempts } => {
                    stats.delivered += 1;
                    metrics.publish(MetricsEvent::Forwarded { decision, attempts });
                }
                ForwardOutcome::Failed { attempts, error } => {
                    stats.failed += 1;
                    metrics.publish(MetricsEvent::ForwardFailed {
                        decision,
                        attempts,
                        error,
                    });
                }
            }
        }

        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "📤 Forwarder stopped"
        );
        stats
    })
}
