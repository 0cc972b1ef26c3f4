//! 判定エンジンの非同期サービス層
//!
//! 入力受付と周期 tick の 2 つのタスクが、1 つの `parking_lot::Mutex<LiveBrain>` を
//! 取り合う。ロックは同期的な判定 1 ステップの間だけ保持し、`.await` を跨がない。
//! 下流への転送とメトリクス送信はロックの外で行う。

pub mod downstream;
pub mod forward;

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::brain::decision::{Action, Decision};
use crate::brain::event::RawCommentEvent;
use crate::brain::live_brain::{BrainSnapshot, EngineEvent, LiveBrain};
use crate::config::AppConfig;
use crate::error::{LiveBrainError, LiveBrainResult};
use crate::io::parse_event_line;
use crate::observability::{spawn_metrics_sink, MetricsCollector, MetricsEvent, MetricsExport, MetricsSink, MetricsSummary};

pub use downstream::{ChannelDownstream, Downstream, NdjsonDownstream};
pub use forward::{spawn_forwarder, ForwardOutcome, ForwardStats, Forwarder};

/// サービスへの入力
#[derive(Debug, Clone)]
pub enum Incoming {
    /// パース済みのコメント
    Event(RawCommentEvent),
    /// 未パースの NDJSON 1 行
    Line(String),
    /// 視聴者数のサンプル
    ViewerCount(u64),
    /// エンジン外で発話があった
    MarkSpoken,
    /// 配信セッションの区切り
    ResetSession,
}

/// 実行中サービスへの操作口
#[derive(Clone)]
pub struct ServiceHandle {
    intake: mpsc::Sender<Incoming>,
    shutdown: Arc<watch::Sender<bool>>,
    core: Arc<Mutex<LiveBrain>>,
}

impl ServiceHandle {
    /// 入力を投入する（シャットダウン後は `Shutdown` エラー）
    pub async fn submit(&self, incoming: Incoming) -> LiveBrainResult<()> {
        if *self.shutdown.borrow() {
            return Err(LiveBrainError::Shutdown);
        }
        self.intake
            .send(incoming)
            .await
            .map_err(|_| LiveBrainError::Shutdown)
    }

    /// 受付を停止し、サービスを終了させる
    pub fn shutdown(&self) {
        info!("🛑 Shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 現在の状態を取得
    pub fn snapshot(&self) -> BrainSnapshot {
        self.core.lock().snapshot(Utc::now())
    }
}

/// 終了時のレポート
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub snapshot: BrainSnapshot,
    pub forward: ForwardStats,
    pub metrics: MetricsSummary,
}

/// 判定結果の配送（メトリクスへは全件、下流へは SPEAK のみ）
#[derive(Clone)]
struct Dispatcher {
    forward_tx: mpsc::Sender<Decision>,
    metrics: MetricsSink,
}

impl Dispatcher {
    async fn dispatch(&self, events: Vec<EngineEvent>) {
        for event in events {
            let speak = match &event {
                EngineEvent::Decided { decision, .. } if decision.action == Action::Speak => Some(decision.clone()),
                _ => None,
            };
            self.metrics.publish(MetricsEvent::Engine(event));
            if let Some(decision) = speak {
                if self.forward_tx.send(decision).await.is_err() {
                    warn!("⚠️ Forwarder stopped, SPEAK decision not forwarded");
                }
            }
        }
    }
}

/// 判定サービス
pub struct BrainService {
    core: Arc<Mutex<LiveBrain>>,
    collector: Arc<MetricsCollector>,
    config: AppConfig,
}

impl BrainService {
    pub fn new(config: AppConfig) -> LiveBrainResult<Self> {
        config.brain.validate()?;
        let now = Utc::now();
        Ok(Self {
            core: Arc::new(Mutex::new(LiveBrain::new(config.brain.clone(), now))),
            collector: Arc::new(MetricsCollector::new(now)),
            config,
        })
    }

    pub fn core(&self) -> Arc<Mutex<LiveBrain>> {
        Arc::clone(&self.core)
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.collector)
    }

    /// サービスを起動する
    pub fn start(self, downstream: Arc<dyn Downstream>) -> (ServiceHandle, JoinHandle<ServiceReport>) {
        let (intake_tx, intake_rx) = mpsc::channel(self.config.service.intake_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ServiceHandle {
            intake: intake_tx,
            shutdown: Arc::new(shutdown_tx),
            core: Arc::clone(&self.core),
        };

        let task = tokio::spawn(self.run(downstream, intake_rx, shutdown_rx));
        (handle, task)
    }

    async fn run(
        self,
        downstream: Arc<dyn Downstream>,
        mut intake: mpsc::Receiver<Incoming>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServiceReport {
        info!(downstream = downstream.name(), "🚀 Brain service started");

        let export = self.config.service.metrics_dir.clone().map(|dir| MetricsExport {
            dir,
            interval: Duration::from_secs(self.config.brain.metrics_export_interval.max(1)),
        });
        let (metrics, metrics_task) =
            spawn_metrics_sink(Arc::clone(&self.collector), self.config.service.metrics_buffer, export);

        let (forward_tx, forward_rx) = mpsc::channel(self.config.service.intake_buffer.max(1));
        let forwarder = Forwarder::new(downstream, self.config.forward.clone());
        let forward_task = spawn_forwarder(forwarder, forward_rx, metrics.clone());

        let dispatcher = Dispatcher { forward_tx, metrics };

        let (stop_ticks, ticks_stopped) = watch::channel(false);
        let tick_task = tokio::spawn(run_ticks(
            Arc::clone(&self.core),
            dispatcher.clone(),
            Duration::from_millis(self.config.service.tick_interval_ms.max(1)),
            ticks_stopped,
        ));

        loop {
            tokio::select! {
                incoming = intake.recv() => {
                    match incoming {
                        Some(incoming) => {
                            let events = self.handle_incoming(incoming);
                            dispatcher.dispatch(events).await;
                        }
                        None => {
                            debug!("Intake closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // 受付停止。残りの入力は判定しない
        intake.close();
        let mut discarded = 0;
        while intake.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "⚠️ Pending inputs discarded at shutdown");
        }

        // 実行中の tick は配送まで終えてから止まる。昇格済みの SPEAK を落とさない。
        stop_ticks.send_replace(true);
        if let Err(e) = tick_task.await {
            warn!(error = %e, "❌ Tick task ended abnormally");
        }

        let now = Utc::now();
        let (events, snapshot) = {
            let mut core = self.core.lock();
            core.shutdown(now);
            (core.take_events(), core.snapshot(now))
        };
        dispatcher.dispatch(events).await;
        drop(dispatcher);

        let forward = forward_task.await.unwrap_or_else(|e| {
            warn!(error = %e, "❌ Forwarder task ended abnormally");
            ForwardStats::default()
        });
        if let Err(e) = metrics_task.await {
            warn!(error = %e, "❌ Metrics task ended abnormally");
        }

        let metrics = self.collector.summary(Utc::now(), None);
        info!(
            decisions = metrics.total_decisions,
            forwarded = forward.delivered,
            forward_failed = forward.failed,
            "🛑 Brain service stopped"
        );

        ServiceReport {
            snapshot,
            forward,
            metrics,
        }
    }

    /// 1 入力を同期的に処理し、発生したイベントを返す
    fn handle_incoming(&self, incoming: Incoming) -> Vec<EngineEvent> {
        let now = Utc::now();
        let mut core = self.core.lock();
        match incoming {
            Incoming::Event(raw) => {
                core.decide_raw(raw, now);
            }
            Incoming::Line(line) => match parse_event_line(&line, 0) {
                Ok(Some(raw)) => {
                    core.decide_raw(raw, now);
                }
                Ok(None) => {}
                // JSON オブジェクトでない行。拾えるフィールドはない
                Err(e) => {
                    core.reject(RawCommentEvent::default(), &e, now);
                }
            },
            Incoming::ViewerCount(count) => {
                core.update_viewer_count(count);
            }
            Incoming::MarkSpoken => {
                core.mark_spoken(now);
            }
            Incoming::ResetSession => {
                core.reset_session(now);
            }
        }
        core.take_events()
    }
}

/// 周期 tick。`stop` が立つと、処理中の配送を終えてから抜ける。
async fn run_ticks(
    core: Arc<Mutex<LiveBrain>>,
    dispatcher: Dispatcher,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let events = {
                    let mut core = core.lock();
                    if !core.is_accepting() {
                        break;
                    }
                    core.tick(Utc::now());
                    core.take_events()
                };
                dispatcher.dispatch(events).await;
            }
        }
    }
    debug!("Tick task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::Reason;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn raw(user: &str, text: &str, intent: &str) -> RawCommentEvent {
        serde_json::from_value(json!({
            "user_id": user,
            "text": text,
            "intent": intent,
            "timestamp": Utc::now().timestamp() as f64,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_speak_is_forwarded_and_everything_is_counted() {
        let service = BrainService::new(AppConfig::default()).unwrap();
        let (downstream, mut received) = ChannelDownstream::new(16);
        let (handle, task) = service.start(Arc::new(downstream));

        handle.submit(Incoming::Event(raw("u1", "I'll take it", "purchase_intent"))).await.unwrap();
        handle.submit(Incoming::Event(raw("u2", "hmm", "unknown"))).await.unwrap();
        handle.submit(Incoming::Line("not json".to_string())).await.unwrap();

        let envelope = received.recv().await.unwrap();
        assert_eq!(envelope.decision.reason, Reason::AutoPriority);

        // 入力が処理されるのを待ってから止める
        while handle.snapshot().counters.received < 3 {
            tokio::task::yield_now().await;
        }
        handle.shutdown();
        let report = task.await.unwrap();

        assert_eq!(report.forward.delivered, 1);
        assert_eq!(report.metrics.total_decisions, 3);
        assert_eq!(report.metrics.reasons.get("DECISION_ERROR"), Some(&1));
        assert!(!report.snapshot.accepting);
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let service = BrainService::new(AppConfig::default()).unwrap();
        let (downstream, _received) = ChannelDownstream::new(4);
        let (handle, task) = service.start(Arc::new(downstream));

        handle.shutdown();
        task.await.unwrap();
        let err = handle.submit(Incoming::ViewerCount(10)).await.unwrap_err();
        assert!(matches!(err, LiveBrainError::Shutdown));
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_service() {
        let service = BrainService::new(AppConfig::default()).unwrap();
        let (downstream, _received) = ChannelDownstream::new(4);
        let (handle, task) = service.start(Arc::new(downstream));

        drop(handle);
        let report = task.await.unwrap();
        assert_eq!(report.metrics.total_decisions, 0);
        assert!(!report.snapshot.accepting);
    }

    /// 1 件ごとに待たせる下流
    struct SlowDownstream {
        delay: Duration,
        delivered: AtomicU64,
    }

    #[async_trait]
    impl Downstream for SlowDownstream {
        async fn forward(&self, _envelope: &crate::io::DecisionEnvelope) -> LiveBrainResult<()> {
            tokio::time::sleep(self.delay).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_promoted_speaks_survive_shutdown() {
        let mut config = AppConfig::default();
        config.brain.min_speak_interval = 0.01;
        config.brain.max_speak_interval = 0.01;
        config.service.tick_interval_ms = 2;
        // 転送チャネルを 1 件にして、tick の配送が詰まる状況を作る
        config.service.intake_buffer = 1;

        let service = BrainService::new(config).unwrap();
        let downstream = Arc::new(SlowDownstream {
            delay: Duration::from_millis(15),
            delivered: AtomicU64::new(0),
        });
        let (handle, task) = service.start(downstream.clone());

        for i in 0..8 {
            let comment = raw(&format!("u{}", i), &format!("question number {}", i), "question");
            handle.submit(Incoming::Event(comment)).await.unwrap();
        }
        while handle.snapshot().counters.received < 8 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        let report = task.await.unwrap();

        let speaks = report.metrics.actions.get("SPEAK").copied().unwrap_or(0);
        assert!(speaks > 1);
        assert_eq!(report.forward.delivered + report.forward.failed, speaks);
        assert_eq!(downstream.delivered.load(Ordering::SeqCst), report.forward.delivered);
        // キューを経由したコメントは QUEUE と最終判定の 2 件になる
        assert!(report.metrics.total_decisions >= 8);
        assert_eq!(report.snapshot.queue_depth, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.brain.max_queue_size = 0;
        assert!(BrainService::new(config).is_err());
    }
}
