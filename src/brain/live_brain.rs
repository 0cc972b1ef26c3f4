//! 判定エンジン（Live Brain）
//!
//! 重複フィルタ・スコアラー・クールダウン・ファネル状態機械・キューを束ね、
//! 1 コメントにつき 1 つの SPEAK / SKIP / QUEUE を返す。
//! すべての操作は同期的で、呼び出し側が 1 つの排他区間で直列化する。
//! 発生した判定と遷移は outbox に積まれ、`take_events` でまとめて取り出す。

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cooldown::{CooldownState, CooldownWindow};
use super::decision::{decision_confidence, speak_reason, Action, Decision, DecisionOrigin, Reason};
use super::duplicate_filter::{DuplicateFilter, DuplicatePolicy};
use super::event::{CommentEvent, Intent, RawCommentEvent};
use super::queue::{BoundedPriorityQueue, PendingEntry, QueueError};
use super::scorer::{self, Priority};
use super::timing;
use crate::config::BrainConfig;
use crate::error::LiveBrainError;
use crate::sale_flow::{FunnelStats, Phase, SaleStateMachine, Transition};

/// outbox の保持上限（取り出されない場合は古いものから捨てる）
const OUTBOX_LIMIT: usize = 4096;

/// エンジンが外部へ通知するイベント
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Decided { decision: Decision, queue_depth: usize },
    Transitioned(Transition),
}

/// 判定カウンタ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub received: u64,
    pub speak: u64,
    pub skip: u64,
    pub queued: u64,
    pub promoted: u64,
    pub expired: u64,
    pub evicted: u64,
    pub malformed: u64,
}

/// 診断用スナップショット
#[derive(Debug, Clone, Serialize)]
pub struct BrainSnapshot {
    pub phase: Phase,
    pub saved_phase: Option<Phase>,
    pub cooldown: CooldownState,
    pub cooldown_remaining_secs: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_high_water_mark: usize,
    pub counters: EngineCounters,
    pub accepting: bool,
    pub session_started_at: DateTime<Utc>,
    pub funnel: FunnelStats,
}

/// 判定エンジン本体
#[derive(Debug)]
pub struct LiveBrain {
    config: BrainConfig,
    filter: DuplicateFilter,
    cooldown: CooldownWindow,
    funnel: SaleStateMachine,
    queue: BoundedPriorityQueue,
    last_viewer_count: Option<u64>,
    session_started_at: DateTime<Utc>,
    outbox: VecDeque<EngineEvent>,
    counters: EngineCounters,
    accepting: bool,
}

impl LiveBrain {
    pub fn new(config: BrainConfig, now: DateTime<Utc>) -> Self {
        Self::with_duplicate_policy(config, DuplicatePolicy::default(), now)
    }

    pub fn with_duplicate_policy(config: BrainConfig, policy: DuplicatePolicy, now: DateTime<Utc>) -> Self {
        let cooldown = CooldownWindow::new(
            timing::secs(config.min_speak_interval),
            timing::secs(config.max_speak_interval),
            config.auto_priority(),
        );
        let funnel = SaleStateMachine::from_config(&config, now);
        let queue = BoundedPriorityQueue::new(config.max_queue_size);

        info!(
            min_interval = config.min_speak_interval,
            max_interval = config.max_speak_interval,
            queue_capacity = config.max_queue_size,
            state_machine = config.enable_state_machine,
            "🧠 Live brain initialized"
        );

        Self {
            config,
            filter: DuplicateFilter::new(policy),
            cooldown,
            funnel,
            queue,
            last_viewer_count: None,
            session_started_at: now,
            outbox: VecDeque::new(),
            counters: EngineCounters::default(),
            accepting: true,
        }
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.funnel.current_phase()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    /// ワイヤレコードを検証して判定する。不正な入力は DECISION_ERROR の SKIP になる。
    pub fn decide_raw(&mut self, raw: RawCommentEvent, now: DateTime<Utc>) -> Decision {
        match CommentEvent::try_from_raw(raw.clone(), now) {
            Ok(event) => self.decide(event, now),
            Err(e) => self.reject(raw, &e, now),
        }
    }

    /// 入力を拒否し、DECISION_ERROR の判定を作る
    pub fn reject(&mut self, raw: RawCommentEvent, error: &LiveBrainError, now: DateTime<Utc>) -> Decision {
        warn!(error = %error, "❌ Rejecting malformed comment event");
        self.counters.received += 1;
        self.counters.malformed += 1;
        let event = Arc::new(CommentEvent::salvage(raw, now));
        self.finish(event, Action::Skip, Reason::DecisionError, Priority::MIN, now, DecisionOrigin::Direct)
    }

    /// 1 コメントを判定する
    pub fn decide(&mut self, event: CommentEvent, now: DateTime<Utc>) -> Decision {
        self.counters.received += 1;

        if !self.accepting {
            let event = Arc::new(event);
            return self.finish(event, Action::Skip, Reason::Shutdown, Priority::MIN, now, DecisionOrigin::Direct);
        }

        let event = Arc::new(self.resolve_viewer_delta(event));

        if self.filter.check_and_insert(&event.user_id, &event.text, now) {
            return self.finish(event, Action::Skip, Reason::Duplicate, Priority::MIN, now, DecisionOrigin::Direct);
        }

        if event.intent == Intent::Spam {
            return self.finish(event, Action::Skip, Reason::Spam, Priority::MIN, now, DecisionOrigin::Direct);
        }

        let priority = scorer::score(&event, self.funnel.current_phase());

        if priority <= self.config.skip_priority() {
            return self.finish(event, Action::Skip, Reason::LowPriority, priority, now, DecisionOrigin::Direct);
        }

        if priority >= self.config.auto_priority() {
            return self.speak(event, priority, Reason::AutoPriority, now, DecisionOrigin::Direct);
        }

        if priority >= self.config.high_priority() && self.cooldown.may_speak(now, priority) {
            let reason = speak_reason(event.intent);
            return self.speak(event, priority, reason, now, DecisionOrigin::Direct);
        }

        self.admit(event, priority, now)
    }

    /// 周期処理: 状態の時間減衰、期限切れの破棄、キュー先頭の昇格
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        if let Some(transition) = self.funnel.on_tick(now) {
            self.push_event(EngineEvent::Transitioned(transition));
        }

        let mut decisions = Vec::new();
        let max_residency = timing::secs(self.config.queue_timeout);
        for entry in self.queue.expire(now, max_residency) {
            self.counters.expired += 1;
            decisions.push(self.finish(
                entry.event,
                Action::Skip,
                Reason::Expired,
                entry.priority,
                now,
                DecisionOrigin::Queue,
            ));
        }

        if let Some(decision) = self.try_promote(now) {
            decisions.push(decision);
        }
        decisions
    }

    /// エンジン外の発話（台本セリフなど）でクールダウンを延長する
    pub fn mark_spoken(&mut self, now: DateTime<Utc>) -> Duration {
        let applied = self.cooldown.extend(now, timing::secs(self.config.default_cooldown));
        debug!(cooldown_secs = timing::as_secs_f64(applied), "🔇 External speech recorded");
        applied
    }

    /// 視聴者数のサンプルを記録し、前回からの増減を返す
    pub fn update_viewer_count(&mut self, count: u64) -> i64 {
        let delta = match self.last_viewer_count {
            Some(previous) => signed(count).saturating_sub(signed(previous)),
            None => 0,
        };
        self.last_viewer_count = Some(count);
        self.funnel.observe_viewers(count);
        delta
    }

    /// 受付を停止し、現在のキューを 1 回だけ消化した後、残りを SHUTDOWN で破棄する
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        if !self.accepting {
            return Vec::new();
        }
        self.accepting = false;
        info!(queue_depth = self.queue.len(), "🛑 Live brain shutting down");

        let mut decisions = self.tick(now);
        decisions.extend(self.flush_queue(now));
        decisions
    }

    /// 配信セッションの終了: キューを破棄し、ファネル・クールダウン・重複窓を初期化する
    pub fn reset_session(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let decisions = self.flush_queue(now);
        if let Some(transition) = self.funnel.reset(now) {
            self.push_event(EngineEvent::Transitioned(transition));
        }
        self.cooldown.reset();
        self.filter.clear();
        self.last_viewer_count = None;
        self.session_started_at = now;
        self.counters = EngineCounters::default();
        self.accepting = true;
        info!("🔄 Session reset");
        decisions
    }

    /// 溜まったイベントをすべて取り出す
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.outbox.drain(..).collect()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BrainSnapshot {
        BrainSnapshot {
            phase: self.funnel.current_phase(),
            saved_phase: self.funnel.saved_phase(),
            cooldown: self.cooldown.state(),
            cooldown_remaining_secs: self.cooldown.remaining_secs(now),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            queue_high_water_mark: self.queue.high_water_mark(),
            counters: self.counters,
            accepting: self.accepting,
            session_started_at: self.session_started_at,
            funnel: self.funnel.stats(now),
        }
    }

    fn resolve_viewer_delta(&mut self, mut event: CommentEvent) -> CommentEvent {
        if let Some(count) = event.source.viewer_count {
            let derived = self.update_viewer_count(count);
            if !event.has_explicit_viewer_delta() {
                event.viewer_count_delta = derived;
            }
        }
        event
    }

    fn admit(&mut self, event: Arc<CommentEvent>, priority: Priority, now: DateTime<Utc>) -> Decision {
        let entry = PendingEntry::new(Arc::clone(&event), priority, now);
        let entry = match self.queue.insert(entry) {
            Ok(()) => return self.finish(event, Action::Queue, Reason::Queued, priority, now, DecisionOrigin::Direct),
            Err(QueueError::Full(entry)) => entry,
        };

        let Some(evicted) = self.queue.evict_lowest_if_lower(priority) else {
            return self.finish(event, Action::Skip, Reason::QueueFull, priority, now, DecisionOrigin::Direct);
        };
        self.counters.evicted += 1;
        self.finish(
            evicted.event,
            Action::Skip,
            Reason::Evicted,
            evicted.priority,
            now,
            DecisionOrigin::Queue,
        );

        match self.queue.insert(entry) {
            Ok(()) => self.finish(event, Action::Queue, Reason::Queued, priority, now, DecisionOrigin::Direct),
            Err(QueueError::Full(_)) => {
                self.finish(event, Action::Skip, Reason::QueueFull, priority, now, DecisionOrigin::Direct)
            }
        }
    }

    fn try_promote(&mut self, now: DateTime<Utc>) -> Option<Decision> {
        let top = self.queue.peek_highest()?.priority;
        if !self.cooldown.may_speak(now, top) {
            return None;
        }

        let silence = self
            .cooldown
            .silence(now)
            .unwrap_or_else(|| now - self.session_started_at);
        let dead_air = silence >= timing::secs(self.config.max_speak_interval);
        if top < self.config.high_priority() && !dead_air {
            return None;
        }

        let entry = self.queue.pop_highest()?;
        self.counters.promoted += 1;
        Some(self.speak(entry.event, entry.priority, Reason::Promoted, now, DecisionOrigin::Queue))
    }

    fn flush_queue(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        self.queue
            .drain_all()
            .into_iter()
            .map(|entry| {
                self.finish(
                    entry.event,
                    Action::Skip,
                    Reason::Shutdown,
                    entry.priority,
                    now,
                    DecisionOrigin::Queue,
                )
            })
            .collect()
    }

    /// SPEAK の副作用（クールダウン記録とファネル遷移）を判定と同時に適用する
    fn speak(
        &mut self,
        event: Arc<CommentEvent>,
        priority: Priority,
        reason: Reason,
        now: DateTime<Utc>,
        origin: DecisionOrigin,
    ) -> Decision {
        self.cooldown.record_speak(now, priority);
        self.funnel.notify_speak();
        if let Some(transition) = self.funnel.apply_event(event.intent, now) {
            self.push_event(EngineEvent::Transitioned(transition));
        }
        self.finish(event, Action::Speak, reason, priority, now, origin)
    }

    fn finish(
        &mut self,
        event: Arc<CommentEvent>,
        action: Action,
        reason: Reason,
        priority: Priority,
        now: DateTime<Utc>,
        origin: DecisionOrigin,
    ) -> Decision {
        match action {
            Action::Speak => self.counters.speak += 1,
            Action::Skip => self.counters.skip += 1,
            Action::Queue => self.counters.queued += 1,
        }

        let phase = self.funnel.current_phase();
        let decision = Decision {
            event,
            action,
            reason,
            priority,
            cooldown_applied: self.cooldown.remaining_secs(now),
            confidence: decision_confidence(action, reason, priority),
            phase,
            response_style: phase.response_style(),
            decided_at: now,
            origin,
        };

        if decision.is_speak() {
            info!(
                user_id = %decision.event.user_id,
                intent = %decision.event.intent,
                priority = %priority,
                reason = %reason,
                phase = %phase,
                cooldown_secs = decision.cooldown_applied,
                "🗣️ SPEAK"
            );
        } else {
            debug!(
                user_id = %decision.event.user_id,
                intent = %decision.event.intent,
                action = %action,
                reason = %reason,
                priority = %priority,
                "Decision"
            );
        }

        self.push_event(EngineEvent::Decided {
            decision: decision.clone(),
            queue_depth: self.queue.len(),
        });
        decision
    }

    fn push_event(&mut self, event: EngineEvent) {
        if self.outbox.len() >= OUTBOX_LIMIT {
            self.outbox.pop_front();
            warn!("⚠️ Engine outbox overflow, dropping oldest event");
        }
        self.outbox.push_back(event);
    }
}

fn signed(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
