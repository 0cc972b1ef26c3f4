//! 判定メトリクスの集計
//!
//! 判定の決定経路には乗らない純粋な消費者。エンジンの outbox から流れてくる
//! `EngineEvent` と転送結果を受け取り、カウンタと統計を更新する。

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::brain::decision::{Action, Decision, Reason};
use crate::brain::live_brain::EngineEvent;
use crate::brain::timing;
use crate::error::LiveBrainResult;

/// 直近判定の保持件数（時間窓集計用）
const RECENT_DECISIONS_LIMIT: usize = 10_000;
/// 発話間隔サンプルの保持件数
const SPEAK_INTERVAL_LIMIT: usize = 1_000;

/// シンクに流れるイベント
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    Engine(EngineEvent),
    Forwarded { decision: Decision, attempts: u32 },
    ForwardFailed { decision: Decision, attempts: u32, error: String },
}

/// 間隔統計
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntervalStats {
    pub count: usize,
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub stddev_secs: f64,
}

impl IntervalStats {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let count = samples.len();
        let avg = samples.iter().sum::<f64>() / count as f64;
        let variance = samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / count as f64;
        Self {
            count,
            avg_secs: avg,
            min_secs: samples.iter().copied().fold(f64::INFINITY, f64::min),
            max_secs: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            stddev_secs: variance.sqrt(),
        }
    }
}

/// 集計結果
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub window_secs: Option<f64>,
    pub total_decisions: u64,
    pub window_decisions: u64,
    pub actions: BTreeMap<String, u64>,
    pub reasons: BTreeMap<String, u64>,
    /// SPEAK / 全判定
    pub response_rate: f64,
    pub speak_interval: IntervalStats,
    /// index 0 が優先度 1
    pub priority_histogram: Vec<u64>,
    pub queue_high_water_mark: usize,
    pub transitions: BTreeMap<String, u64>,
    pub forwarded: u64,
    pub forward_failed: u64,
    pub dropped_events: u64,
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    total_decisions: u64,
    actions: BTreeMap<String, u64>,
    reasons: BTreeMap<Reason, u64>,
    recent: VecDeque<(DateTime<Utc>, Action)>,
    last_speak_at: Option<DateTime<Utc>>,
    speak_intervals: VecDeque<f64>,
    priority_histogram: [u64; 10],
    queue_high_water_mark: usize,
    transitions: BTreeMap<String, u64>,
    forwarded: u64,
    forward_failed: u64,
}

impl MetricsState {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            total_decisions: 0,
            actions: BTreeMap::new(),
            reasons: BTreeMap::new(),
            recent: VecDeque::new(),
            last_speak_at: None,
            speak_intervals: VecDeque::new(),
            priority_histogram: [0; 10],
            queue_high_water_mark: 0,
            transitions: BTreeMap::new(),
            forwarded: 0,
            forward_failed: 0,
        }
    }

    fn record_decision(&mut self, decision: &Decision, queue_depth: usize) {
        self.total_decisions += 1;
        *self.actions.entry(decision.action.to_string()).or_insert(0) += 1;
        *self.reasons.entry(decision.reason).or_insert(0) += 1;
        self.priority_histogram[usize::from(decision.priority.value() - 1)] += 1;
        self.queue_high_water_mark = self.queue_high_water_mark.max(queue_depth);

        if self.recent.len() == RECENT_DECISIONS_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back((decision.decided_at, decision.action));

        if decision.is_speak() {
            if let Some(last) = self.last_speak_at {
                if self.speak_intervals.len() == SPEAK_INTERVAL_LIMIT {
                    self.speak_intervals.pop_front();
                }
                self.speak_intervals
                    .push_back(timing::as_secs_f64(decision.decided_at - last).max(0.0));
            }
            self.last_speak_at = Some(decision.decided_at);
        }
    }
}

/// メトリクス集計器
#[derive(Debug)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
    dropped: AtomicU64,
}

impl MetricsCollector {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(MetricsState::new(now)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: &MetricsEvent) {
        let mut state = self.state.lock();
        match event {
            MetricsEvent::Engine(EngineEvent::Decided { decision, queue_depth }) => {
                state.record_decision(decision, *queue_depth);
            }
            MetricsEvent::Engine(EngineEvent::Transitioned(transition)) => {
                let key = format!("{}->{}", transition.from, transition.to);
                *state.transitions.entry(key).or_insert(0) += 1;
            }
            MetricsEvent::Forwarded { .. } => state.forwarded += 1,
            MetricsEvent::ForwardFailed { .. } => {
                state.forward_failed += 1;
                *state.reasons.entry(Reason::ForwardFailed).or_insert(0) += 1;
            }
        }
    }

    /// シンクで取りこぼしたイベント数を加算
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total_decisions(&self) -> u64 {
        self.state.lock().total_decisions
    }

    pub fn reason_count(&self, reason: Reason) -> u64 {
        self.state.lock().reasons.get(&reason).copied().unwrap_or(0)
    }

    /// 集計結果を作る。`window` を指定するとその期間内の判定数も数える。
    pub fn summary(&self, now: DateTime<Utc>, window: Option<Duration>) -> MetricsSummary {
        let state = self.state.lock();

        let window_decisions = match window {
            Some(window) => {
                let cutoff = now - window;
                state.recent.iter().filter(|(at, _)| *at >= cutoff).count() as u64
            }
            None => state.total_decisions,
        };

        let speak = state.actions.get("SPEAK").copied().unwrap_or(0);
        let response_rate = if state.total_decisions == 0 {
            0.0
        } else {
            speak as f64 / state.total_decisions as f64
        };

        MetricsSummary {
            generated_at: now,
            uptime_secs: timing::as_secs_f64(now - state.started_at),
            window_secs: window.map(timing::as_secs_f64),
            total_decisions: state.total_decisions,
            window_decisions,
            actions: state.actions.clone(),
            reasons: state
                .reasons
                .iter()
                .map(|(reason, count)| (reason.to_string(), *count))
                .collect(),
            response_rate,
            speak_interval: IntervalStats::from_samples(&state.speak_intervals),
            priority_histogram: state.priority_histogram.to_vec(),
            queue_high_water_mark: state.queue_high_water_mark,
            transitions: state.transitions.clone(),
            forwarded: state.forwarded,
            forward_failed: state.forward_failed,
            dropped_events: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// 集計結果を JSON ファイルに書き出す
    pub fn export_to_json(&self, path: &Path, now: DateTime<Utc>) -> LiveBrainResult<()> {
        let summary = self.summary(now, None);
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|source| crate::error::LiveBrainError::Json { line: 0, source })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        info!(path = %path.display(), decisions = summary.total_decisions, "📊 Metrics exported");
        Ok(())
    }
}

/// シンクへの送信口（満杯なら捨てて決定経路を止めない）
#[derive(Debug, Clone)]
pub struct MetricsSink {
    sender: mpsc::Sender<MetricsEvent>,
    collector: Arc<MetricsCollector>,
}

impl MetricsSink {
    pub fn publish(&self, event: MetricsEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.collector.record_dropped(1);
                warn!("⚠️ Metrics channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Metrics sink closed, event ignored");
            }
        }
    }
}

/// 定期出力の設定
#[derive(Debug, Clone)]
pub struct MetricsExport {
    pub dir: PathBuf,
    pub interval: std::time::Duration,
}

/// 出力ファイル名（例: metrics_20240101_000000.json）
pub fn export_file_name(now: DateTime<Utc>, is_final: bool) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    if is_final {
        format!("metrics_final_{}.json", stamp)
    } else {
        format!("metrics_{}.json", stamp)
    }
}

/// シンクタスクを起動する
///
/// 送信口がすべて破棄されるとチャネルが閉じ、最終出力を書いて終了する。
pub fn spawn_metrics_sink(
    collector: Arc<MetricsCollector>,
    buffer: usize,
    export: Option<MetricsExport>,
) -> (MetricsSink, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    let sink = MetricsSink {
        sender,
        collector: Arc::clone(&collector),
    };
    let handle = tokio::spawn(run_metrics_sink(collector, receiver, export));
    (sink, handle)
}

async fn run_metrics_sink(
    collector: Arc<MetricsCollector>,
    mut receiver: mpsc::Receiver<MetricsEvent>,
    export: Option<MetricsExport>,
) {
    info!("📊 Metrics sink started");

    let period = export
        .as_ref()
        .map(|e| e.interval)
        .unwrap_or(std::time::Duration::from_secs(3600));
    let mut interval = tokio::time::interval(period);
    // 最初の即時 tick を読み捨てる
    interval.tick().await;

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Some(event) => collector.record(&event),
                    None => break,
                }
            }
            _ = interval.tick(), if export.is_some() => {
                if let Some(export) = &export {
                    let now = Utc::now();
                    let path = export.dir.join(export_file_name(now, false));
                    if let Err(e) = collector.export_to_json(&path, now) {
                        warn!(error = %e, "❌ Periodic metrics export failed");
                    }
                }
            }
        }
    }

    if let Some(export) = &export {
        let now = Utc::now();
        let path = export.dir.join(export_file_name(now, true));
        if let Err(e) = collector.export_to_json(&path, now) {
            warn!(error = %e, "❌ Final metrics export failed");
        }
    }

    info!("📊 Metrics sink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{CommentEvent, Intent, LiveBrain};
    use crate::config::BrainConfig;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn feed(collector: &MetricsCollector, brain: &mut LiveBrain) {
        for event in brain.take_events() {
            collector.record(&MetricsEvent::Engine(event));
        }
    }

    #[test]
    fn test_counts_and_speak_intervals() {
        let collector = MetricsCollector::new(t0());
        let mut brain = LiveBrain::new(BrainConfig::default(), t0());

        brain.decide(CommentEvent::new("u1", "hello shop", Intent::Greeting, t0()), t0());
        brain.decide(CommentEvent::new("u2", "hmm", Intent::Unknown, t0()), t0());
        let later = t0() + Duration::seconds(10);
        brain.decide(CommentEvent::new("u3", "I want it", Intent::PurchaseIntent, later), later);
        feed(&collector, &mut brain);

        let summary = collector.summary(later, None);
        assert_eq!(summary.total_decisions, 3);
        assert_eq!(summary.actions.get("SPEAK"), Some(&2));
        assert_eq!(summary.reasons.get("LOW_PRIORITY"), Some(&1));
        assert_eq!(summary.speak_interval.count, 1);
        assert_eq!(summary.speak_interval.avg_secs, 10.0);
        assert_eq!(summary.transitions.get("IDLE->WARM_UP"), Some(&1));
        assert!((summary.response_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.priority_histogram.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_windowed_summary() {
        let collector = MetricsCollector::new(t0());
        let mut brain = LiveBrain::new(BrainConfig::default(), t0());
        brain.decide(CommentEvent::new("u1", "first", Intent::Unknown, t0()), t0());
        let later = t0() + Duration::seconds(120);
        brain.decide(CommentEvent::new("u2", "second", Intent::Unknown, later), later);
        feed(&collector, &mut brain);

        let summary = collector.summary(later, Some(Duration::seconds(60)));
        assert_eq!(summary.window_decisions, 1);
        assert_eq!(summary.total_decisions, 2);
        assert_eq!(summary.window_secs, Some(60.0));
    }

    #[test]
    fn test_export_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let collector = MetricsCollector::new(t0());
        let path = dir.path().join("nested").join(export_file_name(t0(), true));
        collector.export_to_json(&path, t0()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["total_decisions"], 0);
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("metrics_final_"));
    }

    #[tokio::test]
    async fn test_sink_writes_final_export_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::new(Utc::now()));
        let export = MetricsExport {
            dir: dir.path().to_path_buf(),
            interval: std::time::Duration::from_secs(300),
        };
        let (sink, handle) = spawn_metrics_sink(Arc::clone(&collector), 16, Some(export));

        let mut brain = LiveBrain::new(BrainConfig::default(), Utc::now());
        brain.decide(CommentEvent::new("u1", "hello", Intent::Greeting, Utc::now()), Utc::now());
        for event in brain.take_events() {
            sink.publish(MetricsEvent::Engine(event));
        }
        drop(sink);
        handle.await.unwrap();

        assert_eq!(collector.total_decisions(), 1);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let collector = Arc::new(MetricsCollector::new(Utc::now()));
        let (sender, _receiver) = mpsc::channel(1);
        let sink = MetricsSink {
            sender,
            collector: Arc::clone(&collector),
        };

        let mut brain = LiveBrain::new(BrainConfig::default(), Utc::now());
        brain.decide(CommentEvent::new("u1", "a", Intent::Unknown, Utc::now()), Utc::now());
        brain.decide(CommentEvent::new("u2", "b", Intent::Unknown, Utc::now()), Utc::now());
        for event in brain.take_events() {
            sink.publish(MetricsEvent::Engine(event));
        }
        assert_eq!(collector.summary(Utc::now(), None).dropped_events, 1);
    }
}
