//! 発話間隔の管理

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::scorer::Priority;
use super::timing;

/// 発話クールダウンウィンドウ
///
/// `next_eligible_at >= last_speak_at + min_interval` を常に満たす。
#[derive(Debug, Clone)]
pub struct CooldownWindow {
    min_interval: Duration,
    max_interval: Duration,
    auto_speak_priority: Priority,
    last_speak_at: Option<DateTime<Utc>>,
    next_eligible_at: Option<DateTime<Utc>>,
}

/// ウィンドウの状態（スナップショット用）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CooldownState {
    pub last_speak_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl CooldownWindow {
    pub fn new(min_interval: Duration, max_interval: Duration, auto_speak_priority: Priority) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
            auto_speak_priority,
            last_speak_at: None,
            next_eligible_at: None,
        }
    }

    /// 通常の発話が可能か
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.map_or(true, |next| now >= next)
    }

    /// 優先度を考慮した発話可否（自動発話優先度はクールダウンを無視）
    pub fn may_speak(&self, now: DateTime<Utc>, priority: Priority) -> bool {
        priority >= self.auto_speak_priority || self.is_open(now)
    }

    /// 次に発話可能になるまでの残り時間
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.next_eligible_at {
            Some(next) if next > now => next - now,
            _ => Duration::zero(),
        }
    }

    /// 優先度に反比例するクールダウン長（min〜max の線形補間）
    pub fn cooldown_for(&self, priority: Priority) -> Duration {
        let min_ms = self.min_interval.num_milliseconds() as f64;
        let max_ms = self.max_interval.num_milliseconds() as f64;
        let step = f64::from(priority.value() - 1) / 9.0;
        Duration::milliseconds((max_ms - (max_ms - min_ms) * step).round() as i64)
    }

    /// 発話を記録し、適用したクールダウン長を返す
    pub fn record_speak(&mut self, now: DateTime<Utc>, priority: Priority) -> Duration {
        let cooldown = self.cooldown_for(priority);
        self.last_speak_at = Some(now);
        self.next_eligible_at = Some(now + cooldown);
        cooldown
    }

    /// エンジン外の発話でウィンドウを延長する（短縮はしない）
    pub fn extend(&mut self, now: DateTime<Utc>, cooldown: Duration) -> Duration {
        let cooldown = cooldown.max(self.min_interval);
        let candidate = now + cooldown;
        self.last_speak_at = Some(now);
        self.next_eligible_at = Some(match self.next_eligible_at {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
        cooldown
    }

    /// 最後の発話からの経過時間（未発話なら None）
    pub fn silence(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_speak_at.map(|last| now - last)
    }

    pub fn reset(&mut self) {
        self.last_speak_at = None;
        self.next_eligible_at = None;
    }

    pub fn state(&self) -> CooldownState {
        CooldownState {
            last_speak_at: self.last_speak_at,
            next_eligible_at: self.next_eligible_at,
        }
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> f64 {
        timing::as_secs_f64(self.remaining(now))
    }
}
