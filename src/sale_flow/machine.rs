//! セールファネル状態機械
//!
//! 遷移表は全域。未定義の (フェーズ, 意図) は自己ループになる。
//! HANDLING_QUESTION は 1 段だけの退避フェーズで直前のフェーズへ戻る。
//! 時間経過による減衰は `on_tick` からのみ行い、イベント処理には埋め込まない。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::states::{Phase, ResponseStyle};
use crate::brain::event::Intent;
use crate::brain::timing;
use crate::config::BrainConfig;
use crate::error::LiveBrainError;

/// 遷移履歴の保持上限
const HISTORY_LIMIT: usize = 100;

/// 遷移のきっかけ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "intent", rename_all = "snake_case")]
pub enum Trigger {
    /// SPEAK 確定後の意図
    Intent(Intent),
    /// 無遷移タイムアウト
    Timeout,
    /// CRISIS の解消
    CrisisResolved,
    /// セッション終了
    Reset,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Intent(intent) => write!(f, "intent:{}", intent),
            Trigger::Timeout => f.write_str("timeout"),
            Trigger::CrisisResolved => f.write_str("crisis_resolved"),
            Trigger::Reset => f.write_str("reset"),
        }
    }
}

/// 遷移レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub trigger: Trigger,
    pub at: DateTime<Utc>,
}

/// ファネルの現在状態（セッション中に 1 つだけ存在する）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelState {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub last_transition_trigger: Option<Trigger>,
    /// フェーズ突入時の視聴者数
    #[serde(default)]
    pub viewers_at_entry: Option<u64>,
}

/// 状態機械の統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStats {
    pub current_phase: Phase,
    pub phase_duration_secs: f64,
    pub transition_count: u64,
    pub phase_durations_secs: HashMap<Phase, f64>,
    pub speak_counts: HashMap<Phase, u64>,
    pub history_length: usize,
    /// 現フェーズ突入時からの視聴者数の増減
    pub viewer_delta: i64,
}

/// 通常フローの遷移表。None は自己ループ（既定）。
///
/// 割り込み（complaint / 質問系）と CRISIS・HANDLING_QUESTION からの
/// 復帰は `resolve` 側で先に処理される。
pub fn forward_target(phase: Phase, intent: Intent) -> Option<Phase> {
    match (phase, intent) {
        (Phase::Idle, i) if i.is_engagement() => Some(Phase::WarmUp),
        (Phase::WarmUp, Intent::ProductQuestion) => Some(Phase::Interest),
        (Phase::Interest, Intent::PriceQuestion) => Some(Phase::Price),
        (Phase::Price, Intent::PurchaseIntent | Intent::PriceQuestion) => Some(Phase::Cta),
        // CTA 中の SPEAK は押し売りを避けるため COOLDOWN へ
        (Phase::Cta, _) => Some(Phase::Cooldown),
        _ => None,
    }
}

/// 退避フェーズを考慮した次フェーズの解決
///
/// Err は遷移表の不整合（HANDLING_QUESTION なのに退避フェーズがない等）。
fn resolve(phase: Phase, intent: Intent, saved: Option<Phase>) -> Result<Phase, LiveBrainError> {
    if phase == Phase::Crisis {
        return Ok(Phase::Cooldown);
    }
    if intent == Intent::Complaint {
        return Ok(Phase::Crisis);
    }
    if phase == Phase::HandlingQuestion {
        if intent.is_question_class() {
            return Ok(Phase::HandlingQuestion);
        }
        return saved.ok_or_else(|| LiveBrainError::StateTransitionUndefined {
            phase: phase.to_string(),
            trigger: intent.to_string(),
        });
    }
    if intent.is_question_class() {
        return Ok(Phase::HandlingQuestion);
    }
    Ok(forward_target(phase, intent).unwrap_or(phase))
}

/// セールファネル状態機械
#[derive(Debug)]
pub struct SaleStateMachine {
    state: FunnelState,
    /// HANDLING_QUESTION 突入直前のフェーズ
    saved_phase: Option<Phase>,
    enabled: bool,
    auto_transition: bool,
    idle_timeout: Duration,
    viewer_count: Option<u64>,
    transition_count: u64,
    history: VecDeque<Transition>,
    phase_durations: HashMap<Phase, f64>,
    speak_counts: HashMap<Phase, u64>,
}

impl SaleStateMachine {
    pub fn new(enabled: bool, auto_transition: bool, idle_timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            state: FunnelState {
                phase: Phase::Idle,
                entered_at: now,
                last_transition_trigger: None,
                viewers_at_entry: None,
            },
            saved_phase: None,
            enabled,
            auto_transition,
            idle_timeout,
            viewer_count: None,
            transition_count: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            phase_durations: HashMap::new(),
            speak_counts: HashMap::new(),
        }
    }

    pub fn from_config(config: &BrainConfig, now: DateTime<Utc>) -> Self {
        Self::new(
            config.enable_state_machine,
            config.auto_state_transition,
            timing::secs(config.idle_timeout),
            now,
        )
    }

    pub fn current_phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &FunnelState {
        &self.state
    }

    pub fn saved_phase(&self) -> Option<Phase> {
        self.saved_phase
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn response_style(&self) -> ResponseStyle {
        self.state.phase.response_style()
    }

    /// 意図を遷移表に適用し、新しいフェーズを返す
    pub fn on_event(&mut self, intent: Intent, now: DateTime<Utc>) -> Phase {
        self.apply_event(intent, now);
        self.state.phase
    }

    /// 意図を適用し、フェーズが変わった場合は遷移レコードを返す
    pub fn apply_event(&mut self, intent: Intent, now: DateTime<Utc>) -> Option<Transition> {
        if !self.enabled {
            return None;
        }

        let from = self.state.phase;
        let to = match resolve(from, intent, self.saved_phase) {
            Ok(to) => to,
            Err(e) => {
                warn!(error = %e, "⚠️ State machine invariant violated, staying in place");
                from
            }
        };

        // 割り込みを挟まない遷移は前進だけ。最短滞在に満たなければ保留する。
        if from != to && !from.is_interrupt() && !to.is_interrupt() {
            let min_dwell = self.dwell(from.profile().min_dwell);
            if now - self.state.entered_at < min_dwell {
                debug!(
                    from = %from,
                    to = %to,
                    min_dwell_secs = timing::as_secs_f64(min_dwell),
                    "Minimum dwell not reached, holding phase"
                );
                return None;
            }
        }

        if to == Phase::HandlingQuestion && from != Phase::HandlingQuestion {
            self.saved_phase = Some(from);
        } else if from == Phase::HandlingQuestion && to != Phase::HandlingQuestion {
            self.saved_phase = None;
        }

        let trigger = if from == Phase::Crisis {
            Trigger::CrisisResolved
        } else {
            Trigger::Intent(intent)
        };
        self.transition_to(to, trigger, now)
    }

    /// 時間経過による減衰を適用する
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if !self.enabled || !self.auto_transition {
            return None;
        }

        let phase = self.state.phase;
        if phase == Phase::Crisis {
            return self.transition_to(Phase::Cooldown, Trigger::CrisisResolved, now);
        }

        if now - self.state.entered_at < self.dwell(phase.profile().max_dwell) {
            return None;
        }

        let target = if phase == Phase::HandlingQuestion {
            match self.saved_phase.take() {
                Some(saved) => Some(saved),
                None => {
                    warn!(
                        phase = %phase,
                        "⚠️ HANDLING_QUESTION without a saved phase, staying in place"
                    );
                    None
                }
            }
        } else {
            phase.profile().decay_target
        };

        target.and_then(|to| self.transition_to(to, Trigger::Timeout, now))
    }

    /// 視聴者数のサンプルを記録する
    pub fn observe_viewers(&mut self, count: u64) {
        self.viewer_count = Some(count);
        if self.state.viewers_at_entry.is_none() {
            self.state.viewers_at_entry = Some(count);
        }
    }

    /// 現フェーズ突入時からの視聴者数の増減
    pub fn viewer_delta(&self) -> i64 {
        match (self.state.viewers_at_entry, self.viewer_count) {
            (Some(entry), Some(current)) => {
                i64::try_from(current)
                    .unwrap_or(i64::MAX)
                    .saturating_sub(i64::try_from(entry).unwrap_or(i64::MAX))
            }
            _ => 0,
        }
    }

    /// SPEAK を現フェーズの統計に記録
    pub fn notify_speak(&mut self) {
        *self.speak_counts.entry(self.state.phase).or_insert(0) += 1;
    }

    /// セッション終了時に IDLE へ戻す
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.saved_phase = None;
        let transition = self.transition_to(Phase::Idle, Trigger::Reset, now);
        self.transition_count = 0;
        self.history.clear();
        self.phase_durations.clear();
        self.speak_counts.clear();
        self.state.entered_at = now;
        transition
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> FunnelStats {
        FunnelStats {
            current_phase: self.state.phase,
            phase_duration_secs: timing::as_secs_f64(now - self.state.entered_at),
            transition_count: self.transition_count,
            phase_durations_secs: self.phase_durations.clone(),
            speak_counts: self.speak_counts.clone(),
            history_length: self.history.len(),
            viewer_delta: self.viewer_delta(),
        }
    }

    /// フェーズ設定の倍率を期間に換算
    fn dwell(&self, factor: f64) -> Duration {
        timing::secs(timing::as_secs_f64(self.idle_timeout) * factor)
    }

    fn transition_to(&mut self, to: Phase, trigger: Trigger, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state.phase;
        if from == to {
            debug!(phase = %from, trigger = %trigger, "Self-loop, phase unchanged");
            return None;
        }

        let spent = timing::as_secs_f64(now - self.state.entered_at).max(0.0);
        *self.phase_durations.entry(from).or_insert(0.0) += spent;

        self.state = FunnelState {
            phase: to,
            entered_at: now,
            last_transition_trigger: Some(trigger),
            viewers_at_entry: self.viewer_count,
        };
        self.transition_count += 1;

        let transition = Transition { from, to, trigger, at: now };
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        info!(from = %from, to = %to, trigger = %trigger, "🔄 Sale phase transition");
        Some(transition)
    }
}
