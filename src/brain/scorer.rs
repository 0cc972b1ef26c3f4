//! 優先度スコアラー
//!
//! 意図の基本優先度にフェーズ補正・視聴者補正・フラットボーナスを適用し、
//! 1〜10 の整数に丸める純関数。

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::event::{CommentEvent, Intent};
use crate::sale_flow::Phase;

/// 優先度（1〜10）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    /// 範囲外は 1〜10 に丸める
    pub fn new(value: i64) -> Self {
        Priority(value.clamp(1, 10) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// 意図ごとの基本優先度
pub fn base_priority(intent: Intent) -> f64 {
    match intent {
        Intent::PurchaseIntent => 10.0,
        Intent::PriceQuestion => 9.0,
        Intent::ProductQuestion => 8.0,
        Intent::Complaint => 7.0,
        Intent::Question => 7.0,
        Intent::ShippingQuestion => 6.0,
        Intent::Request => 6.0,
        Intent::Greeting => 6.0,
        Intent::Thanks => 5.0,
        Intent::Compliment => 5.0,
        Intent::Chitchat => 4.0,
        Intent::Unknown => 3.0,
        Intent::Spam => 1.0,
    }
}

/// (フェーズ, 意図) ごとの倍率。表にない組み合わせは 1.0。
pub fn state_modifier(phase: Phase, intent: Intent) -> f64 {
    use Intent::*;
    match (phase, intent) {
        (Phase::Idle, Greeting | Chitchat) => 1.2,
        (Phase::WarmUp, ProductQuestion | Greeting) => 1.1,
        (Phase::Interest, PriceQuestion | ProductQuestion) => 1.1,
        (Phase::Price, PriceQuestion) => 1.2,
        (Phase::Price, PurchaseIntent) => 1.5,
        (Phase::Cta, PurchaseIntent) => 1.5,
        (Phase::Cta, PriceQuestion) => 1.1,
        (Phase::Cooldown, ProductQuestion | PriceQuestion) => 0.9,
        (Phase::Cooldown, Thanks) => 1.2,
        (Phase::HandlingQuestion, Question | ShippingQuestion) => 1.2,
        (Phase::HandlingQuestion, ProductQuestion) => 1.1,
        // CRISIS 中は販売系・雑談系を抑え、苦情対応を優先する
        (Phase::Crisis, Complaint) => 1.4,
        (Phase::Crisis, Greeting | Chitchat | Compliment) => 0.5,
        (Phase::Crisis, Thanks | PurchaseIntent) => 0.8,
        (Phase::Crisis, ProductQuestion | PriceQuestion) => 0.6,
        _ => 1.0,
    }
}

/// 視聴者数の増加で盛り上げ系の意図を持ち上げる
pub fn viewer_modifier(intent: Intent, viewer_count_delta: i64) -> f64 {
    if !intent.is_engagement() {
        return 1.0;
    }
    match viewer_count_delta {
        d if d >= 20 => 1.2,
        d if d > 0 => 1.1,
        _ => 1.0,
    }
}

/// フォロワー・サブスク・ギフトのボーナス
pub fn bonus(event: &CommentEvent) -> f64 {
    let membership = if event.is_subscriber {
        2.0
    } else if event.is_follower {
        1.0
    } else {
        0.0
    };

    let gift = if event.gift_value > 0.0 {
        (1.0 + (event.gift_value / 100.0).floor()).min(3.0)
    } else {
        0.0
    };

    membership + gift
}

/// スコア内訳（デバッグログ用）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub state_modifier: f64,
    pub viewer_modifier: f64,
    pub bonus: f64,
    pub raw: f64,
    pub priority: Priority,
}

/// 内訳付きでスコアを計算
pub fn score_breakdown(event: &CommentEvent, phase: Phase) -> ScoreBreakdown {
    let base = base_priority(event.intent);
    let state = state_modifier(phase, event.intent);
    let viewer = viewer_modifier(event.intent, event.viewer_count_delta);
    let bonus = bonus(event);
    let raw = base * state * viewer + bonus;

    let breakdown = ScoreBreakdown {
        base,
        state_modifier: state,
        viewer_modifier: viewer,
        bonus,
        raw,
        priority: Priority::new(raw.round() as i64),
    };
    trace!(?breakdown, intent = %event.intent, phase = %phase, "Scored event");
    breakdown
}

/// イベントの優先度を計算
pub fn score(event: &CommentEvent, phase: Phase) -> Priority {
    score_breakdown(event, phase).priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(intent: Intent) -> CommentEvent {
        CommentEvent::new("u1", "text", intent, Utc::now())
    }

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(0), Priority::MIN);
        assert_eq!(Priority::new(42), Priority::MAX);
        assert_eq!(Priority::new(7).value(), 7);
    }

    #[test]
    fn test_base_scores_in_neutral_phase() {
        // INTEREST では挨拶に補正がない
        assert_eq!(score(&event(Intent::Greeting), Phase::Interest).value(), 6);
        assert_eq!(score(&event(Intent::Unknown), Phase::Interest).value(), 3);
        assert_eq!(score(&event(Intent::Spam), Phase::Interest).value(), 1);
    }

    #[test]
    fn test_price_question_in_price_phase_with_follower() {
        let e = event(Intent::PriceQuestion).with_follower(true);
        // 9 * 1.2 + 1 = 11.8 -> 10
        assert_eq!(score(&e, Phase::Price), Priority::MAX);
    }

    #[test]
    fn test_crisis_suppresses_sales_intents() {
        let breakdown = score_breakdown(&event(Intent::PriceQuestion), Phase::Crisis);
        assert!((breakdown.raw - 5.4).abs() < 1e-9);
        assert_eq!(breakdown.priority.value(), 5);
        assert_eq!(score(&event(Intent::Greeting), Phase::Crisis).value(), 3);
    }

    #[test]
    fn test_viewer_boost_only_for_engagement() {
        let greeting = event(Intent::Chitchat).with_viewer_delta(25);
        // 4 * 1.2 = 4.8 -> 5
        assert_eq!(score(&greeting, Phase::Interest).value(), 5);

        let question = event(Intent::ProductQuestion).with_viewer_delta(25);
        assert_eq!(score(&question, Phase::Interest).value(), 9);
    }

    #[test]
    fn test_subscriber_and_gift_bonus() {
        let e = event(Intent::Chitchat).with_subscriber(true).with_gift(250.0);
        assert_eq!(bonus(&e), 2.0 + 3.0);
        let small = event(Intent::Chitchat).with_gift(50.0);
        assert_eq!(bonus(&small), 1.0);
    }

    #[test]
    fn test_every_pair_stays_in_range() {
        for phase in Phase::ALL {
            for intent in Intent::ALL {
                let e = event(intent)
                    .with_subscriber(true)
                    .with_gift(1000.0)
                    .with_viewer_delta(100);
                let p = score(&e, phase).value();
                assert!((1..=10).contains(&p));
            }
        }
    }
}
